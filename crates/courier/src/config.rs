use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

use crate::queue::{ConsumerTuning, QueueMode, ReplayTuning};
use crate::watchdog::WatchdogConfig;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

// ============================================================================
// QueueSettings
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_queue_mode")]
    pub mode: QueueMode,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_suspended_queue_name")]
    pub suspended_queue_name: String,
    #[serde(default)]
    pub consumer: ConsumerSettings,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            mode: default_queue_mode(),
            queue_name: default_queue_name(),
            suspended_queue_name: default_suspended_queue_name(),
            consumer: ConsumerSettings::default(),
        }
    }
}

fn default_queue_mode() -> QueueMode {
    QueueMode::Local
}

fn default_queue_name() -> String {
    "events".to_string()
}

fn default_suspended_queue_name() -> String {
    "suspended-events".to_string()
}

// ============================================================================
// ConsumerSettings
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default = "default_first_message_wait")]
    pub first_message_wait_seconds: u64,
    #[serde(default = "default_batch_wait")]
    pub batch_wait_seconds: u64,
    #[serde(default = "default_receive_retry")]
    pub receive_retry_seconds: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_seconds: u64,
    #[serde(default = "default_replay_batch_size")]
    pub replay_batch_size: usize,
    #[serde(default = "default_replay_wait")]
    pub replay_wait_seconds: u64,
}

impl ConsumerSettings {
    pub fn tuning(&self) -> ConsumerTuning {
        ConsumerTuning {
            first_message_wait: Duration::from_secs(self.first_message_wait_seconds),
            batch_wait: Duration::from_secs(self.batch_wait_seconds),
            receive_retry: Duration::from_secs(self.receive_retry_seconds),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_seconds),
        }
    }

    pub fn replay_tuning(&self) -> ReplayTuning {
        ReplayTuning {
            batch_size: self.replay_batch_size,
            wait: Duration::from_secs(self.replay_wait_seconds),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            first_message_wait_seconds: default_first_message_wait(),
            batch_wait_seconds: default_batch_wait(),
            receive_retry_seconds: default_receive_retry(),
            reconnect_delay_seconds: default_reconnect_delay(),
            replay_batch_size: default_replay_batch_size(),
            replay_wait_seconds: default_replay_wait(),
        }
    }
}

fn default_first_message_wait() -> u64 {
    30
}

fn default_batch_wait() -> u64 {
    2
}

fn default_receive_retry() -> u64 {
    1
}

fn default_reconnect_delay() -> u64 {
    10
}

fn default_replay_batch_size() -> usize {
    10
}

fn default_replay_wait() -> u64 {
    5
}

// ============================================================================
// WatchdogSettings
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WatchdogSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,
}

impl WatchdogSettings {
    pub fn registry_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            max_iterations: self.max_iterations,
            stop_grace: Duration::from_secs(self.stop_grace_seconds),
        }
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            stop_grace_seconds: default_stop_grace(),
        }
    }
}

fn default_max_iterations() -> u32 {
    30
}

fn default_stop_grace() -> u64 {
    5
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.request_timeout_seconds, 30);
        assert_eq!(config.queue.mode, QueueMode::Local);
        assert_eq!(config.queue.queue_name, "events");
        assert_eq!(config.queue.suspended_queue_name, "suspended-events");
        assert_eq!(config.queue.consumer.first_message_wait_seconds, 30);
        assert_eq!(config.queue.consumer.batch_wait_seconds, 2);
        assert_eq!(config.queue.consumer.reconnect_delay_seconds, 10);
        assert_eq!(config.queue.consumer.replay_batch_size, 10);
        assert_eq!(config.watchdog.max_iterations, 30);
        assert_eq!(config.watchdog.stop_grace_seconds, 5);
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let missing_path = tmp_dir.path().join("missing-config.yaml");
        let config = Config::load(missing_path.to_str().unwrap()).await.unwrap();
        assert_eq!(config.queue.mode, QueueMode::Local);
        assert_eq!(config.server.port, 8080);
    }

    #[tokio::test]
    async fn test_load_valid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  host: "127.0.0.1"
  port: 3000
queue:
  mode: broker
  queue_name: "events-prod"
  consumer:
    batch_wait_seconds: 5
watchdog:
  max_iterations: 10
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.queue.mode, QueueMode::Broker);
        assert_eq!(config.queue.queue_name, "events-prod");
        assert_eq!(config.queue.consumer.batch_wait_seconds, 5);
        // Untouched fields keep their defaults.
        assert_eq!(config.queue.consumer.first_message_wait_seconds, 30);
        assert_eq!(config.watchdog.max_iterations, 10);
    }

    #[tokio::test]
    async fn test_load_invalid_yaml_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "queue: [not, a, map").unwrap();
        let result = Config::load(file.path().to_str().unwrap()).await;
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_tuning_conversions() {
        let consumer = ConsumerSettings::default();
        let tuning = consumer.tuning();
        assert_eq!(tuning.first_message_wait, Duration::from_secs(30));
        assert_eq!(tuning.batch_wait, Duration::from_secs(2));
        let replay = consumer.replay_tuning();
        assert_eq!(replay.batch_size, 10);
        assert_eq!(replay.wait, Duration::from_secs(5));
    }
}
