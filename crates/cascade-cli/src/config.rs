//! Configuration loading for the CLI

use anyhow::{Context, Result};
use cascade_gnn::config::CascadeConfig;
use std::path::{Path, PathBuf};

/// File picked up from the working directory when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "cascade.json";

/// Environment variable naming a config file.
const CONFIG_ENV: &str = "CASCADE_CONFIG";

/// Resolve and load the engine configuration.
///
/// Precedence: explicit path, then `CASCADE_CONFIG`, then `./cascade.json`,
/// then built-in defaults. Command-line flags are applied on top by each
/// command.
pub fn load(path: Option<PathBuf>) -> Result<CascadeConfig> {
    let candidate = path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    if let Some(path) = candidate {
        return read(&path);
    }

    let local = Path::new(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return read(local);
    }
    Ok(CascadeConfig::default())
}

fn read(path: &Path) -> Result<CascadeConfig> {
    let config = CascadeConfig::from_json_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded configuration");
    Ok(config)
}
