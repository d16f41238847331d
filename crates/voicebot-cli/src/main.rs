use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use voicebot_core::DispatchError;
use voicebot_gateway::GatewayServer;

mod config;

use config::VoicebotConfig;

#[derive(Parser)]
#[command(name = "voicebot")]
#[command(version)]
#[command(about = "Voicebot: a voice assistant backend with Gemini key failover")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Port to listen on (overrides server.port)
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,
    },

    /// Send a one-shot message through the provider chain
    Ask {
        /// The message to send
        message: String,
    },

    /// Write the default config to ~/.voicebot/config.toml
    Init,

    /// Show current configuration with keys masked
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let (dotenv, cli) = parse_args(dotenvy::dotenv, std::env::args_os());

    // Set up logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match dotenv {
        Ok(path) => debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => warn!("Failed to load .env: {}", e),
    }

    match cli.command {
        Commands::Serve { port } => cmd_serve(&cli.config, port).await,
        Commands::Ask { message } => cmd_ask(&cli.config, &message).await,
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
    }
}

/// Load `.env` before parsing, so clap's `PORT` and the `RUST_LOG` filter see its values
fn parse_args<I, T>(
    load_env: impl FnOnce() -> dotenvy::Result<PathBuf>,
    args: I,
) -> (dotenvy::Result<PathBuf>, Cli)
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let loaded = load_env();
    (loaded, Cli::parse_from(args))
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config::default_config_path();
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        tokio::fs::write(&config_path, config::DEFAULT_CONFIG).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Voicebot initialized at {}", config_dir.display());
    println!(
        "Set GEMINI_API_KEY1 / GEMINI_API_KEY2 in your environment or a .env file, \
         or edit {}.",
        config_path.display()
    );
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = VoicebotConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.masked())?);
    Ok(())
}

async fn cmd_serve(config_path: &Option<PathBuf>, port: Option<u16>) -> Result<()> {
    let cfg = VoicebotConfig::load(config_path)?;
    let set = cfg.build_providers()?;

    info!("Provider status:");
    for entry in &cfg.providers {
        if set.status.get(&entry.id).copied().unwrap_or(false) {
            info!("  {}: ready", entry.id);
        } else {
            warn!("  {}: missing API key", entry.id);
        }
    }
    if set.providers.is_empty() {
        bail!("No provider has an API key. Set GEMINI_API_KEY1 or GEMINI_API_KEY2 and try again.");
    }

    let dispatcher = cfg.build_dispatcher(set.providers)?;
    info!("Failover order: {}", dispatcher.provider_names().join(" -> "));
    info!(
        "Retry policy: {} attempts per provider, {:?} base delay (worst-case wait {:?})",
        dispatcher.retry_policy().attempts(),
        dispatcher.retry_policy().base_delay,
        dispatcher.retry_policy().worst_case_wait()
    );

    let bind = cfg.server.socket_addr(port)?;
    let mut server = GatewayServer::new(bind, Arc::new(dispatcher))
        .with_provider_status(set.status)
        .with_request_timeout(cfg.request_timeout());
    if let Some(dir) = cfg.server.static_dir_path() {
        server = server.with_static_dir(dir);
    }

    info!("Starting voicebot gateway on {}", server.bind());
    server.run(shutdown_signal()).await?;

    println!("Voicebot stopped.");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

async fn cmd_ask(config_path: &Option<PathBuf>, message: &str) -> Result<()> {
    let cfg = VoicebotConfig::load(config_path)?;
    let set = cfg.build_providers()?;
    if set.providers.is_empty() {
        bail!("No provider has an API key. Set GEMINI_API_KEY1 or GEMINI_API_KEY2 and try again.");
    }
    let dispatcher = cfg.build_dispatcher(set.providers)?;

    match dispatcher
        .dispatch_with_deadline(message, cfg.request_timeout())
        .await
    {
        Ok(reply) => {
            println!("{}", reply.text);
            eprintln!("(answered by {} using {})", reply.provider, reply.model);
            Ok(())
        }
        Err(DispatchError::AllProvidersFailed { errors, .. }) => {
            for err in &errors {
                eprintln!("  {}", err);
            }
            bail!("All {} providers failed", errors.len())
        }
        Err(e) => Err(e.into()),
    }
}
