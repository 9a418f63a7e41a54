use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::RevolverConfig;

/// Load configuration from a file using the config crate.
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<RevolverConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously.
pub fn load_config_sync(config_path: &str) -> Result<RevolverConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let revolver_config: RevolverConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(revolver_config)
}

/// Parse configuration from an in-memory YAML/JSON string (dynamic config
/// payloads fetched over HTTP).
pub fn parse_config_str(raw: &str) -> Result<RevolverConfig> {
    let format = if raw.trim_start().starts_with('{') {
        FileFormat::Json
    } else {
        FileFormat::Yaml
    };
    let settings = Config::builder()
        .add_source(File::from_str(raw, format))
        .build()
        .context("Failed to build config from dynamic payload")?;
    settings
        .try_deserialize()
        .context("Failed to deserialize dynamic config payload")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
callback_timeout_ms: 2000
services:
  - type: http
    service: payments
    endpoint:
      type: simple
      endpoints:
        - "127.0.0.1:9001"
    apis:
      - api: orders
        path: "/orders/{id}"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.callback_timeout_ms, 2000);
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "services": [
    {
      "type": "http",
      "service": "payments",
      "endpoint": { "type": "simple", "endpoints": ["127.0.0.1:9001"] },
      "apis": [ { "api": "orders", "path": "/orders" } ]
    }
  ]
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.services.len(), 1);
    }

    #[test]
    fn test_parse_config_str_detects_json() {
        let config = parse_config_str(r#"{"listen_addr": "0.0.0.0:9999"}"#).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9999");

        let config = parse_config_str("listen_addr: \"0.0.0.0:8888\"\n").unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8888");
    }
}
