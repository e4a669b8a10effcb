//! `courier.toml` for the demo binary

use std::fs;
use std::path::{Path, PathBuf};
use serde::Deserialize;
use url::Url;
use crate::queue::{QueueConfig, QueueError, Result};
use crate::uploaders::HttpUploaderConfig;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub endpoint: String,
    pub token: Option<String>,
    pub store_dir: PathBuf,
    pub file_path: PathBuf,
    /// Defaults to the file name of `file_path`
    pub destination_name: Option<String>,
    pub record_id: String,
    pub sub_record_id: Option<String>,
    pub actor_id: String,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Config {
    pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .map_err(|err| QueueError::Config(format!("can't read {}: {}", path.display(), err)))?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(config_str)
            .map_err(|err| QueueError::Config(err.to_string()))?;

        Url::parse(&config.endpoint)
            .map_err(|err| QueueError::Config(format!("invalid endpoint {}: {}", config.endpoint, err)))?;

        Ok(config)
    }

    pub fn destination_name(&self) -> String {
        self.destination_name.clone().unwrap_or_else(|| {
            self.file_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "capture.bin".to_string())
        })
    }

    pub fn uploader_config(&self) -> HttpUploaderConfig {
        HttpUploaderConfig {
            timeout: self.queue.transfer_timeout,
            token: self.token.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SAMPLE: &str = r#"
endpoint = "https://qc.example.com/api/photos"
store_dir = "/var/lib/courier"
file_path = "/tmp/weld-seam.jpg"
record_id = "inspection-42"
actor_id = "inspector-7"

[queue]
concurrency = 1
retry_base_delay = 500
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml(SAMPLE).unwrap();

        assert_eq!(config.destination_name(), "weld-seam.jpg");
        assert_eq!(config.queue.concurrency, 1);
        assert_eq!(config.queue.retry_base_delay, Duration::from_millis(500));
        assert_eq!(config.queue.max_retries, 3);
        assert!(config.token.is_none());
        assert_eq!(config.uploader_config().timeout, config.queue.transfer_timeout);
    }

    #[test]
    fn test_queue_section_is_optional() {
        let config = Config::from_toml(&SAMPLE.replace("[queue]\nconcurrency = 1\nretry_base_delay = 500\n", "")).unwrap();
        assert_eq!(config.queue.concurrency, 2);
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let result = Config::from_toml(&SAMPLE.replace("https://qc.example.com/api/photos", "qc photos"));
        assert!(matches!(result, Err(QueueError::Config(_))));
    }
}
