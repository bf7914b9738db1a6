//! Layered configuration: defaults, then an optional TOML file, then the
//! environment.

use std::path::Path;

use ingest_core::{Error, Result, WorkerConfig};
use serde::Deserialize;

/// Subset of [`WorkerConfig`] that makes sense in a config file. Everything
/// here is optional; unset keys keep the default or the env value.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub database_token: Option<String>,
    pub max_concurrent_per_tenant: Option<u32>,
    pub local_limit: Option<u32>,
    pub embedding_concurrency: Option<usize>,
    pub page_batch_size: Option<usize>,
    pub webhook_notification_url: Option<String>,
    pub export_dir: Option<String>,
}

/// Extra settings that live beside [`WorkerConfig`] in the binary.
#[derive(Debug, Clone)]
pub struct WorkerBinConfig {
    pub core: WorkerConfig,
    pub database_token: String,
    pub export_dir: String,
}

/// Load configuration: defaults, overridden by `path` when given,
/// overridden by the environment.
pub fn load(path: Option<&Path>) -> Result<WorkerBinConfig> {
    let file = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                Error::Configuration(format!("cannot read config file {}: {e}", path.display()))
            })?;
            toml::from_str::<FileConfig>(&raw)
                .map_err(|e| Error::Configuration(format!("invalid config file: {e}")))?
        }
        None => FileConfig::default(),
    };

    // Env wins over file: from_env starts at defaults, so apply the file
    // first and re-apply env on top.
    let mut core = WorkerConfig::from_env()?;
    if std::env::var("REDIS_URL").is_err() {
        if let Some(url) = file.redis_url {
            core.redis_url = url;
        }
    }
    if std::env::var("DATABASE_URL").is_err() {
        if let Some(url) = file.database_url {
            core.database_url = url;
        }
    }
    if let Some(value) = file.max_concurrent_per_tenant {
        core.max_concurrent_per_tenant = value;
    }
    if let Some(value) = file.local_limit {
        core.local_limit = value;
    }
    if let Some(value) = file.embedding_concurrency {
        core.embedding_concurrency = value;
    }
    if let Some(value) = file.page_batch_size {
        core.page_batch_size = value;
    }
    if core.webhook_notification_url.is_none() {
        core.webhook_notification_url = file.webhook_notification_url;
    }

    let database_token =
        std::env::var("DATABASE_TOKEN").unwrap_or_else(|_| file.database_token.unwrap_or_default());
    let export_dir = std::env::var("EXPORT_DIR")
        .ok()
        .or(file.export_dir)
        .unwrap_or_else(|| "./exports".to_string());

    Ok(WorkerBinConfig {
        core,
        database_token,
        export_dir,
    })
}
