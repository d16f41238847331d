//! Browser client: serves the static voice client from a directory

use std::path::Path;

use tower_http::services::ServeDir;
use tracing::{info, warn};

/// Build a file service for `dir`, or `None` when the directory is missing.
///
/// `index.html` is served for directory requests, so `/` loads the client.
pub fn static_service(dir: &Path) -> Option<ServeDir> {
    if !dir.is_dir() {
        warn!(
            "Static client directory {} not found, serving API routes only",
            dir.display()
        );
        return None;
    }
    info!("Serving static client from {}", dir.display());
    Some(ServeDir::new(dir).append_index_html_on_directories(true))
}
