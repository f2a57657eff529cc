//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::{ProgramId, DEFAULT_NAMESPACE};
use crate::store::RetryPolicy;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,

    /// The path to the YAML application spec declaring the flow to run.
    pub flow_spec_path: String,
    /// The namespace of the application.
    #[serde(default = "Config::default_namespace")]
    pub namespace: String,
    /// The name of the application declaring the flow.
    pub application: String,
    /// The name of the flow to run.
    pub flow: String,

    /// The path to the database on disk.
    #[serde(default = "crate::store::default_data_path")]
    pub storage_data_path: String,
    /// The port on which Prometheus metrics are served.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The fixed delay in milliseconds between run record write attempts.
    #[serde(default = "Config::default_run_record_retry_delay_ms")]
    pub run_record_retry_delay_ms: u64,
    /// The maximum number of attempts made for a single run record write.
    #[serde(default = "Config::default_run_record_retry_max_attempts")]
    pub run_record_retry_max_attempts: u32,

    /// An optional bound on how long a fan-out waits for any single instance.
    ///
    /// When unset, fan-outs wait for every instance indefinitely.
    #[serde(default)]
    pub fanout_timeout_seconds: Option<u64>,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    /// The ID of the flow program this process runs.
    pub fn program_id(&self) -> ProgramId {
        ProgramId::flow(self.namespace.clone(), self.application.clone(), self.flow.clone())
    }

    /// The retry policy used for run record writes.
    pub fn run_record_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed_delay(Duration::from_millis(self.run_record_retry_delay_ms), self.run_record_retry_max_attempts)
    }

    /// The timeout applied to each instance of a fan-out, if any.
    pub fn fanout_timeout(&self) -> Option<Duration> {
        self.fanout_timeout_seconds.map(Duration::from_secs)
    }

    fn default_namespace() -> String {
        DEFAULT_NAMESPACE.into()
    }

    fn default_metrics_port() -> u16 {
        7002
    }

    fn default_run_record_retry_delay_ms() -> u64 {
        1000
    }

    fn default_run_record_retry_max_attempts() -> u32 {
        5
    }

    /// Create a config for use in tests, rooted in a temp dir which is removed on drop.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        Ok((
            std::sync::Arc::new(Self {
                rust_log: "error".into(),
                flow_spec_path: tmpdir.path().join("app.yaml").to_string_lossy().to_string(),
                namespace: DEFAULT_NAMESPACE.into(),
                application: "purchases".into(),
                flow: "purchase-flow".into(),
                storage_data_path: tmpdir.path().to_string_lossy().to_string(),
                metrics_port: 7002,
                run_record_retry_delay_ms: 1,
                run_record_retry_max_attempts: 3,
                fanout_timeout_seconds: None,
            }),
            tmpdir,
        ))
    }
}
