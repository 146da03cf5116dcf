//! Configuration for the worker and executor processes.

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

use crate::executor::pool::WorkerType;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Manager
    #[serde(default = "default_manager_url")]
    pub manager_url: String,
    pub worker_id: Option<String>,
    pub selector: Option<String>,
    pub executors: Option<Vec<String>>,

    // Broker / queue executor
    pub redis_url: Option<String>,
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    // Execution pool
    #[serde(default)]
    pub worker_type: WorkerType,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    // Lease cadence
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    // Topic catalog (JSON list of component definitions)
    pub topics_file: Option<PathBuf>,

    // Metrics server
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    #[serde(default = "default_usage_report_interval")]
    pub usage_report_interval_secs: u64,
}

fn default_manager_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_queue_prefix() -> String {
    "conveyor".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_sync_interval() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_usage_report_interval() -> u64 {
    10
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("CONVEYOR")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Stable worker identity, generated when not configured.
    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.manager_url, "http://localhost:5000");
        assert_eq!(config.queue_prefix, "conveyor");
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.worker_type, WorkerType::Thread);
        assert!(config.metrics_enabled);
    }

    #[test]
    fn test_worker_id_is_generated_once_configured_wins() {
        let config: Config = serde_json::from_str(r#"{"worker_id": "w-1"}"#).unwrap();
        assert_eq!(config.worker_id(), "w-1");

        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.worker_id().starts_with("worker-"));
    }
}
