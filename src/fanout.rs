//! Best-effort parallel fan-out.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::{join_all, BoxFuture, FutureExt};

use crate::instance::InstanceRef;
use crate::models::{InstanceCommand, StageKey};

pub const METRIC_INSTANCE_OP_FAILURES: &str = "hadron_flow_instance_op_failures_total";

/// The outcome of a best-effort fan-out.
///
/// A fan-out never fails fast: every participant is driven to completion, and per-participant
/// failures are collected here. Callers decide whether any failure is fatal.
#[derive(Debug)]
pub struct FanOutReport<K> {
    pub succeeded: Vec<K>,
    pub failed: Vec<(K, anyhow::Error)>,
}

impl<K> FanOutReport<K> {
    /// Check if every participant succeeded.
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drive all of the given futures concurrently, collecting every outcome.
///
/// When a timeout is given, any participant which does not finish within it is reported as a
/// failure; the other participants are unaffected.
pub async fn best_effort<K, I, F>(items: I, timeout: Option<Duration>) -> FanOutReport<K>
where
    I: IntoIterator<Item = (K, F)>,
    F: Future<Output = Result<()>>,
{
    let (keys, futs): (Vec<K>, Vec<F>) = items.into_iter().unzip();
    let outcomes = join_all(futs.into_iter().map(|fut| async move {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .unwrap_or_else(|_| Err(anyhow!("timed out after {:?}", timeout))),
            None => fut.await,
        }
    }))
    .await;

    let mut report = FanOutReport {
        succeeded: Vec::with_capacity(keys.len()),
        failed: vec![],
    };
    for (key, outcome) in keys.into_iter().zip(outcomes) {
        match outcome {
            Ok(()) => report.succeeded.push(key),
            Err(err) => report.failed.push((key, err)),
        }
    }
    report
}

/// A lifecycle operation applied to an instance controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceOp {
    Suspend,
    Resume,
    Stop,
    Command(InstanceCommand),
}

impl InstanceOp {
    /// Apply this operation to the given controller.
    pub fn apply(self, ctl: InstanceRef) -> BoxFuture<'static, Result<()>> {
        async move {
            match self {
                Self::Suspend => ctl.suspend().await,
                Self::Resume => ctl.resume().await,
                Self::Stop => ctl.stop().await,
                Self::Command(command) => ctl.command(command).await,
            }
        }
        .boxed()
    }
}

/// Apply an operation to every given instance concurrently, logging per-instance failures.
#[tracing::instrument(level = "debug", skip(targets, timeout))]
pub async fn fan_out(op: InstanceOp, targets: Vec<(StageKey, InstanceRef)>, timeout: Option<Duration>) -> FanOutReport<StageKey> {
    let report = best_effort(targets.into_iter().map(|(key, ctl)| (key, op.apply(ctl))), timeout).await;
    for (key, err) in report.failed.iter() {
        metrics::increment_counter!(METRIC_INSTANCE_OP_FAILURES);
        tracing::warn!(error = ?err, instance = %key, ?op, "instance operation failed");
    }
    report
}
