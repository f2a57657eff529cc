//! Run record storage.

mod db;
mod retry;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ProgramRunId, RunRecord, RunStatus};

pub use db::{default_data_path, SledRunRecordStore, DEFAULT_DATA_PATH};
pub use retry::{supply_with_retries, FixedDelayBackoff, RetryPolicy};

/// Durable storage of run lifecycle records.
#[async_trait]
pub trait RunRecordStore: Send + Sync + 'static {
    /// Record the start of a run.
    async fn set_start(
        &self, run: &ProgramRunId, start_secs: i64, system_args: &BTreeMap<String, String>, user_args: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Record the end of a run with its terminal status.
    async fn set_stop(&self, run: &ProgramRunId, stop_secs: i64, status: RunStatus, failure: Option<&str>) -> Result<()>;

    /// Record that a run has been suspended.
    async fn set_suspend(&self, run: &ProgramRunId) -> Result<()>;

    /// Record that a run has been resumed.
    async fn set_resume(&self, run: &ProgramRunId) -> Result<()>;

    /// Fetch the record of a run.
    async fn get(&self, run: &ProgramRunId) -> Result<Option<RunRecord>>;
}
