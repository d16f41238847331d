use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use voicebot_core::providers::dispatcher::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_MESSAGE_CHARS, DEFAULT_MAX_RETRIES,
};
use voicebot_core::providers::google::DEFAULT_GEMINI_MODEL;
use voicebot_core::{
    Dispatcher, GenerationConfig, GoogleProvider, LlmProvider, Persona, RetryPolicy,
};

/// Config bundled into the binary, used when no file exists at the default path
pub const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicebotConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub persona: Persona,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub static_dir: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_request_timeout_secs() -> u64 {
    90
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            static_dir: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ServerConfig {
    /// Resolve the listen address, letting `port_override` win over the file
    pub fn socket_addr(&self, port_override: Option<u16>) -> Result<SocketAddr> {
        let port = port_override.unwrap_or(self.port);
        (self.bind.as_str(), port)
            .to_socket_addrs()
            .with_context(|| format!("Invalid bind address {}:{}", self.bind, port))?
            .next()
            .with_context(|| format!("Bind address {}:{} resolved to nothing", self.bind, port))
    }

    pub fn static_dir_path(&self) -> Option<PathBuf> {
        self.static_dir.as_deref().map(expand_home)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY.as_millis() as u64
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.base_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSection {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_model() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}
fn default_temperature() -> f64 {
    GenerationConfig::default().temperature
}
fn default_top_p() -> f64 {
    GenerationConfig::default().top_p
}
fn default_max_output_tokens() -> u32 {
    GenerationConfig::default().max_output_tokens
}
fn default_http_timeout_secs() -> u64 {
    10
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_output_tokens: default_max_output_tokens(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl GenerationSection {
    pub fn sampling(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature,
            top_p: self.top_p,
            max_output_tokens: self.max_output_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

fn default_max_message_chars() -> usize {
    DEFAULT_MAX_MESSAGE_CHARS
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_chars: default_max_message_chars(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub api_key: String,
    /// Overrides `generation.model` for this provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("api_key", &mask_secret(&self.api_key))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ProviderConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

/// Providers built from config, in dispatch order
pub struct ProviderSet {
    /// Every listed provider id → whether it has a key
    pub status: BTreeMap<String, bool>,
    /// Only the providers that have a key
    pub providers: Vec<Arc<dyn LlmProvider>>,
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voicebot")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl VoicebotConfig {
    /// Load `custom_path`, or `~/.voicebot/config.toml`, or the embedded default
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = match custom_path {
            Some(path) => path.clone(),
            None => {
                let path = default_config_path();
                if !path.exists() {
                    info!(
                        "No config at {}, using built-in defaults. Run `voicebot init` to customize.",
                        path.display()
                    );
                    return Self::parse(DEFAULT_CONFIG, "built-in default config");
                }
                path
            }
        };

        check_permissions(&path)?;

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;

        Self::parse(&content, &path.display().to_string())
    }

    /// Expand allowlisted env vars in `content` and parse it
    pub fn parse(content: &str, source: &str) -> Result<Self> {
        if content.contains("AIza") {
            warn!(
                "API key is hardcoded in {}. For security, use environment variables: api_key = \"${{GEMINI_API_KEY1}}\"",
                source
            );
        }

        let expanded = expand_env_vars(content, |name| std::env::var(name).ok());

        let config: Self = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config from {}", source))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            bail!("Config lists no [[providers]]");
        }
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                bail!("Every [[providers]] entry needs a non-empty id");
            }
            if !seen.insert(provider.id.as_str()) {
                bail!("Duplicate provider id '{}'", provider.id);
            }
        }
        if self.limits.max_message_chars == 0 {
            bail!("limits.max_message_chars must be greater than zero");
        }
        if self.generation.http_timeout_secs == 0 {
            bail!("generation.http_timeout_secs must be greater than zero");
        }
        if self.server.request_timeout_secs == 0 {
            bail!("server.request_timeout_secs must be greater than zero");
        }

        // The overall deadline has to outlast every provider timing out in turn,
        // or the later providers never get a chance
        let needed = self.failover_budget();
        if self.request_timeout() < needed {
            bail!(
                "server.request_timeout_secs ({}) is shorter than a full failover \
                 ({} providers x {:?} each = {:?}). Raise it or lower generation.http_timeout_secs",
                self.server.request_timeout_secs,
                self.dispatch_count(),
                self.retry
                    .policy()
                    .provider_budget(Duration::from_secs(self.generation.http_timeout_secs)),
                needed
            );
        }
        Ok(())
    }

    /// Number of providers that take part in dispatch
    fn dispatch_count(&self) -> u32 {
        self.providers
            .iter()
            .filter(|p| p.is_configured())
            .count()
            .max(1) as u32
    }

    /// Worst-case time for every configured provider to time out on every attempt
    pub fn failover_budget(&self) -> Duration {
        self.retry
            .policy()
            .provider_budget(Duration::from_secs(self.generation.http_timeout_secs))
            .saturating_mul(self.dispatch_count())
    }

    /// Build one Gemini client per configured provider, keeping config order
    pub fn build_providers(&self) -> Result<ProviderSet> {
        let timeout = Duration::from_secs(self.generation.http_timeout_secs);
        let mut status = BTreeMap::new();
        let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();

        for entry in &self.providers {
            let configured = entry.is_configured();
            status.insert(entry.id.clone(), configured);
            if !configured {
                continue;
            }

            let model = entry.model.as_deref().unwrap_or(&self.generation.model);
            let mut provider =
                GoogleProvider::new(&entry.id, entry.api_key.trim(), model, timeout)?
                    .with_generation(self.generation.sampling());
            if let Some(base_url) = &entry.base_url {
                provider = provider.with_base_url(base_url);
            }
            providers.push(Arc::new(provider));
        }

        Ok(ProviderSet { status, providers })
    }

    pub fn build_dispatcher(&self, providers: Vec<Arc<dyn LlmProvider>>) -> Result<Dispatcher> {
        Ok(Dispatcher::new(providers)?
            .with_retry_policy(self.retry.policy())
            .with_persona(self.persona.clone())
            .with_max_message_chars(self.limits.max_message_chars))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Copy with every API key masked, for printing
    pub fn masked(&self) -> Self {
        let mut masked = self.clone();
        for provider in &mut masked.providers {
            provider.api_key = mask_secret(&provider.api_key);
        }
        masked
    }
}

/// Refuse config files that group or other can read
fn check_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                bail!(
                    "Config file {:?} has overly permissive permissions ({:o}). \
                     It may contain secrets. Fix with: chmod 600 {:?}",
                    path,
                    mode & 0o777,
                    path
                );
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Allowlist of environment variable names that may be expanded in config files.
const ALLOWED_ENV_VARS: &[&str] = &[
    "GEMINI_API_KEY1",
    "GEMINI_API_KEY2",
    "GOOGLE_AI_API_KEY",
    "VOICEBOT_STATIC_DIR",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = escape_toml_basic(&lookup(&var_name).unwrap_or_default());
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len;
    }
    result
}

/// Escape a value for use inside a TOML basic (double-quoted) string
fn escape_toml_basic(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if c.is_control() => escaped.push_str(&format!("\\u{:04X}", c as u32)),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(s: &str) -> PathBuf {
    match s.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(s),
        },
        None => PathBuf::from(s),
    }
}
