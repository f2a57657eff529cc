//! Program run listeners.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ProgramOptions, ProgramRunId, ProgramState, RunStatus, StateTransition};
use crate::store::{supply_with_retries, RetryPolicy, RunRecordStore};

pub const METRIC_RUN_RECORD_WRITE_FAILURES: &str = "hadron_flow_run_record_write_failures_total";

/// A listener of a program run's state transitions.
///
/// Each registered listener observes the transitions of its run one at a time, in order. The
/// first transition observed has no `from` state and carries the run's state at registration.
#[async_trait]
pub trait ProgramListener: Send + Sync + 'static {
    /// Handle a state transition of the run.
    async fn on_transition(&self, transition: StateTransition);
}

/// A listener which persists the lifecycle of a run to a run record store.
pub struct RunRecordListener {
    store: Arc<dyn RunRecordStore>,
    run: ProgramRunId,
    options: ProgramOptions,
    retry: RetryPolicy,
}

impl RunRecordListener {
    /// Create a new instance.
    pub fn new(store: Arc<dyn RunRecordStore>, run: ProgramRunId, options: ProgramOptions, retry: RetryPolicy) -> Self {
        metrics::register_counter!(
            METRIC_RUN_RECORD_WRITE_FAILURES,
            metrics::Unit::Count,
            "run record writes dropped after exhausting retries"
        );
        Self { store, run, options, retry }
    }

    /// Persist the record write corresponding to the given transition.
    async fn record(&self, transition: &StateTransition) -> Result<()> {
        let (store, run) = (&self.store, &self.run);
        match (transition.from, transition.to) {
            (None, _) => {
                let start_secs = run.run.created_secs;
                supply_with_retries(self.retry, "set run start", move || {
                    store.set_start(run, start_secs, &self.options.system_args, &self.options.user_args)
                })
                .await
            }
            (Some(_), ProgramState::Suspended) => supply_with_retries(self.retry, "set run suspend", move || store.set_suspend(run)).await,
            (Some(_), ProgramState::Resuming) => supply_with_retries(self.retry, "set run resume", move || store.set_resume(run)).await,
            (Some(_), ProgramState::Stopped) => {
                supply_with_retries(self.retry, "set run stop", move || store.set_stop(run, transition.at_secs, RunStatus::Killed, None)).await
            }
            (Some(_), ProgramState::Error) => {
                let failure = transition.cause.as_ref().map(|cause| cause.as_str());
                supply_with_retries(self.retry, "set run failure", move || {
                    store.set_stop(run, transition.at_secs, RunStatus::Failed, failure)
                })
                .await
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ProgramListener for RunRecordListener {
    #[tracing::instrument(level = "debug", skip(self, transition), fields(run = %self.run, to = %transition.to))]
    async fn on_transition(&self, transition: StateTransition) {
        if let Err(err) = self.record(&transition).await {
            metrics::increment_counter!(METRIC_RUN_RECORD_WRITE_FAILURES);
            tracing::error!(error = ?err, "error persisting run record of {}, dropping write", self.run);
        }
    }
}
