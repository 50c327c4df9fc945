use std::path::{Path, PathBuf};

use rewind_engine::RewindConfig;
use tracing::debug;

use crate::cli::Args;
use crate::error::{AppError, Result};

const APP_DIR: &str = "rewind";
const CONFIG_FILE: &str = "config.toml";

/// `<config dir>/rewind/config.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

/// Load the engine configuration. A missing file yields the defaults.
pub fn load(path: Option<&Path>) -> Result<RewindConfig> {
    let explicit = path.is_some();
    let Some(path) = path.map(Path::to_path_buf).or_else(default_path) else {
        return Ok(RewindConfig::default());
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            debug!(path = %path.display(), "No configuration file, using defaults");
            return Ok(RewindConfig::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config = toml::from_str(&content).map_err(|source| AppError::Config {
        path: path.clone(),
        source,
    })?;
    debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Apply command-line overrides on top of the file configuration.
pub fn apply_overrides(config: &mut RewindConfig, args: &Args) {
    if let Some(jobs) = args.jobs {
        config.fetch.max_concurrent_fetches = jobs;
    }
    if args.retain_state {
        config.fetch.retain_state = true;
    }
    if args.force_unlock {
        config.fetch.force_unlock = true;
    }
    if let Some(proxy) = &args.proxy {
        config.http.proxy = Some(proxy.clone());
    }
    if args.no_cache {
        config.general.cache_dir = None;
    } else if config.general.cache_dir.is_none() {
        config.general.cache_dir = dirs::cache_dir().map(|dir| dir.join(APP_DIR));
    }
}
