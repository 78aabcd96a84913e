use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServiceConfig;

/// Load a service configuration from a file. The format is chosen by the
/// file extension; extensionless paths are treated as YAML.
pub fn load_config(config_path: &str) -> Result<ServiceConfig> {
    let path = Path::new(config_path);

    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(config_path, format))
        .build()
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    let service_config: ServiceConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;

    Ok(service_config)
}
