//! Flow controller.
//!
//! The flow controller is the single control handle of a flow run. It owns the controllers of
//! every stage instance of the run, fans lifecycle operations out to all of them, and implements
//! live rescaling of individual stages.
//!
//! ## Serialization
//! Every structural operation (suspend, resume, stop & rescale) holds the run's lock for its
//! entire duration, so structural operations of a run never interleave. The registry & queue
//! binding of the run are only reachable through the lock. Runs share no state.
//!
//! ## Failure Semantics
//! Per-instance failures during suspend, resume & stop are logged and the transition proceeds.
//! A failed rescale is fatal to the run: every instance is stopped, the controller moves to
//! the error state, and the error is returned to the caller.
//!
//! ## Listeners
//! State transitions are delivered to each listener over its own channel and handled by a task
//! dedicated to that listener, in transition order.

mod rescale;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use futures::stream::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::AppError;
use crate::fanout::{fan_out, InstanceOp};
use crate::instance::InstanceFactory;
use crate::listener::ProgramListener;
use crate::models::{FlowSpec, ProgramCommand, ProgramOptions, ProgramRunId, ProgramState, StateTransition};
use crate::queue::{ConsumerQueueBinding, QueuePartitioner};
use crate::registry::ControllerRegistry;

pub const METRIC_STAGE_INSTANCES: &str = "hadron_flow_stage_instances";
pub const METRIC_RESCALES: &str = "hadron_flow_rescales_total";
pub const METRIC_RESCALE_FAILURES: &str = "hadron_flow_rescale_failures_total";

/// Register the metrics emitted by flow controllers.
pub fn register_metrics() {
    metrics::register_gauge!(METRIC_STAGE_INSTANCES, metrics::Unit::Count, "the number of live instances of a flow stage");
    metrics::register_counter!(METRIC_RESCALES, metrics::Unit::Count, "the number of stage rescales attempted");
    metrics::register_counter!(METRIC_RESCALE_FAILURES, metrics::Unit::Count, "the number of stage rescales which failed & stopped their run");
    metrics::register_counter!(crate::fanout::METRIC_INSTANCE_OP_FAILURES, metrics::Unit::Count, "instance operations which failed during a fan-out");
}

/// The collaborators & immutable context of a flow run.
pub struct FlowContext {
    /// The ID of the run.
    pub run: ProgramRunId,
    /// The spec of the flow being run.
    pub flow: Arc<FlowSpec>,
    /// The options of the run.
    pub options: ProgramOptions,
    /// The factory used to start new stage instances.
    pub factory: Arc<dyn InstanceFactory>,
    /// The queue system's partitioner.
    pub partitioner: Arc<dyn QueuePartitioner>,
    /// An optional bound on how long a fan-out waits for a single instance.
    pub fanout_timeout: Option<Duration>,
}

/// The structural state of a run, only accessible while holding the run's lock.
struct RunState {
    registry: ControllerRegistry,
    queues: ConsumerQueueBinding,
}

/// The registered listeners of a run.
#[derive(Default)]
struct Listeners {
    channels: Vec<mpsc::UnboundedSender<StateTransition>>,
    /// The failure which moved the run into the error state, if any.
    cause: Option<Arc<String>>,
}

/// The aggregate controller of a flow run.
#[derive(Clone)]
pub struct FlowController {
    inner: Arc<FlowControllerInner>,
}

impl fmt::Debug for FlowController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowController")
            .field("run", &self.inner.ctx.run)
            .field("state", &self.state())
            .finish()
    }
}

struct FlowControllerInner {
    ctx: FlowContext,
    /// The run's lock, serializing all structural operations.
    run_state: Mutex<RunState>,
    state_tx: watch::Sender<ProgramState>,
    state_rx: watch::Receiver<ProgramState>,
    listeners: StdMutex<Listeners>,
    /// The tasks delivering transitions to listeners.
    listener_tasks: StdMutex<Vec<JoinHandle<()>>>,
    /// A snapshot of live instance counts per stage, updated after every structural operation.
    counts: ArcSwap<BTreeMap<String, u32>>,
}

impl FlowController {
    /// Create a new controller over the started instances of a run, marking it alive.
    pub(crate) fn new(ctx: FlowContext, registry: ControllerRegistry, queues: ConsumerQueueBinding) -> Self {
        let (state_tx, state_rx) = watch::channel(ProgramState::Starting);
        let counts = registry.counts();
        let controller = Self {
            inner: Arc::new(FlowControllerInner {
                ctx,
                run_state: Mutex::new(RunState { registry, queues }),
                state_tx,
                state_rx,
                listeners: Default::default(),
                listener_tasks: Default::default(),
                counts: Default::default(),
            }),
        };
        controller.publish_counts(counts);
        controller.transition(ProgramState::Alive, None);
        tracing::info!("flow {} is alive", controller.inner.ctx.run);
        controller
    }

    /// The ID of this controller's run.
    pub fn run_id(&self) -> &ProgramRunId {
        &self.inner.ctx.run
    }

    /// The options of this controller's run.
    pub fn options(&self) -> &ProgramOptions {
        &self.inner.ctx.options
    }

    /// The current state of the run.
    pub fn state(&self) -> ProgramState {
        *self.inner.state_rx.borrow()
    }

    /// A channel of the run's state.
    pub fn watch_state(&self) -> watch::Receiver<ProgramState> {
        self.inner.state_rx.clone()
    }

    /// The failure which moved the run into the error state, if any.
    pub fn failure_cause(&self) -> Option<Arc<String>> {
        self.listeners().cause.clone()
    }

    /// The live instance count of every stage, read without waiting on the run's lock.
    pub fn instance_counts(&self) -> BTreeMap<String, u32> {
        self.inner.counts.load().as_ref().clone()
    }

    /// The live instance IDs of the given stage.
    ///
    /// This waits for any in-flight structural operation to finish.
    pub async fn instance_ids(&self, stage: &str) -> Vec<u32> {
        self.inner.run_state.lock().await.registry.instance_ids(stage)
    }

    /// Register a listener of this run's state transitions.
    ///
    /// The listener first observes the current state as a transition with no `from` state, then
    /// every later transition in order, finishing after the first terminal transition. A listener
    /// added to a run which has already ended observes its terminal state twice: once as the
    /// initial state and once as the terminal transition.
    pub fn add_listener<L: ProgramListener>(&self, listener: L) {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut listeners = self.listeners();
            let state = self.state();
            let init = StateTransition {
                from: None,
                to: state,
                cause: listeners.cause.clone(),
                at_secs: now_secs(),
            };
            if state.is_terminal() {
                let _res = tx.send(init.clone());
                let _res = tx.send(StateTransition { from: Some(state), ..init });
            } else {
                let _res = tx.send(init);
                listeners.channels.push(tx);
            }
        }
        let handle = tokio::spawn(run_listener(listener, rx));
        match self.inner.listener_tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Wait for every listener to finish handling the run's transitions.
    ///
    /// Listeners only finish once the run has reached a terminal state.
    pub async fn join_listeners(&self) {
        let tasks = match self.inner.listener_tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(error = ?err, "error joining listener task of flow {}", self.inner.ctx.run);
            }
        }
    }

    /// Suspend every instance of the run.
    #[tracing::instrument(level = "debug", skip(self), fields(run = %self.inner.ctx.run))]
    pub async fn suspend(&self) -> Result<()> {
        let state = self.inner.run_state.lock().await;
        self.ensure_state("suspend", &[ProgramState::Alive])?;
        tracing::info!("suspending flow {}", self.inner.ctx.run);
        self.transition(ProgramState::Suspending, None);
        let report = fan_out(InstanceOp::Suspend, state.registry.all(), self.inner.ctx.fanout_timeout).await;
        self.transition(ProgramState::Suspended, None);
        tracing::info!(failed = report.failed.len(), "flow {} suspended", self.inner.ctx.run);
        Ok(())
    }

    /// Resume every instance of the run.
    #[tracing::instrument(level = "debug", skip(self), fields(run = %self.inner.ctx.run))]
    pub async fn resume(&self) -> Result<()> {
        let state = self.inner.run_state.lock().await;
        self.ensure_state("resume", &[ProgramState::Suspended])?;
        tracing::info!("resuming flow {}", self.inner.ctx.run);
        self.transition(ProgramState::Resuming, None);
        let report = fan_out(InstanceOp::Resume, state.registry.all(), self.inner.ctx.fanout_timeout).await;
        self.transition(ProgramState::Alive, None);
        tracing::info!(failed = report.failed.len(), "flow {} resumed", self.inner.ctx.run);
        Ok(())
    }

    /// Stop every instance of the run.
    ///
    /// Stopping a stopped run is a no-op.
    #[tracing::instrument(level = "debug", skip(self), fields(run = %self.inner.ctx.run))]
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.inner.run_state.lock().await;
        if self.state() == ProgramState::Stopped {
            return Ok(());
        }
        self.ensure_state("stop", &[ProgramState::Starting, ProgramState::Alive, ProgramState::Suspended])?;
        tracing::info!("stopping flow {}", self.inner.ctx.run);
        self.stop_instances(&mut state).await;
        self.transition(ProgramState::Stopped, None);
        tracing::info!("flow {} stopped", self.inner.ctx.run);
        Ok(())
    }

    /// Deliver a command to the run.
    pub async fn send_command(&self, command: ProgramCommand) -> Result<()> {
        match command {
            ProgramCommand::Rescale { stage, instances } => self.change_instances(&stage, instances).await,
        }
    }

    /// Change the number of instances of a stage while the run is alive.
    ///
    /// A no-op if the stage already has the requested number of instances. Any failure after the
    /// rescale has begun stops the run.
    #[tracing::instrument(level = "debug", skip(self), fields(run = %self.inner.ctx.run))]
    pub async fn change_instances(&self, stage: &str, instances: u32) -> Result<()> {
        let mut state = self.inner.run_state.lock().await;
        self.ensure_state("rescale", &[ProgramState::Alive])?;
        if instances == 0 {
            return Err(AppError::InvalidInput(format!("stage '{}' requires at least 1 instance", stage)).into());
        }
        if self.inner.ctx.flow.stage(stage).is_none() {
            return Err(AppError::UnknownStage(stage.into()).into());
        }
        let live = state.registry.live_count(stage);
        if live == instances {
            tracing::debug!(%stage, instances, "stage already has the requested instance count");
            return Ok(());
        }

        metrics::increment_counter!(METRIC_RESCALES);
        tracing::info!(%stage, from = live, to = instances, "changing stage instances of flow {}", self.inner.ctx.run);
        let res = if live < instances {
            self.increase_instances(&mut state, stage, live, instances).await
        } else {
            self.decrease_instances(&mut state, stage, live, instances).await
        };
        self.publish_counts(state.registry.counts());

        let cause = match res {
            Ok(()) => {
                tracing::info!(%stage, instances, "stage instances changed");
                return Ok(());
            }
            Err(cause) => cause,
        };
        metrics::increment_counter!(METRIC_RESCALE_FAILURES);
        tracing::error!(error = ?cause, %stage, instances, "error changing stage instances, stopping flow {}", self.inner.ctx.run);
        let failure = Arc::new(format!("{:#}", cause));
        self.stop_instances(&mut state).await;
        self.transition(ProgramState::Error, Some(failure));
        Err(AppError::RescaleFailed {
            stage: stage.into(),
            instances,
            cause,
        }
        .into())
    }

    /// Stop & discard every instance of the run.
    async fn stop_instances(&self, state: &mut RunState) {
        self.transition(ProgramState::Stopping, None);
        let report = fan_out(InstanceOp::Stop, state.registry.drain(), self.inner.ctx.fanout_timeout).await;
        if !report.is_ok() {
            tracing::error!(failed = report.failed.len(), "not all instances of flow {} stopped cleanly", self.inner.ctx.run);
        }
        self.publish_counts(state.registry.counts());
    }

    /// Ensure the run is in one of the given states.
    fn ensure_state(&self, op: &'static str, allowed: &[ProgramState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(AppError::InvalidState { op, state }.into())
        }
    }

    /// Move the run into a new state, notifying all listeners.
    fn transition(&self, to: ProgramState, cause: Option<Arc<String>>) {
        let mut listeners = self.listeners();
        let from = self.state();
        let _res = self.inner.state_tx.send(to);
        if cause.is_some() {
            listeners.cause = cause.clone();
        }
        tracing::debug!(%from, %to, "flow {} state transition", self.inner.ctx.run);
        let transition = StateTransition {
            from: Some(from),
            to,
            cause,
            at_secs: now_secs(),
        };
        listeners.channels.retain(|tx| tx.send(transition.clone()).is_ok());
        if to.is_terminal() {
            listeners.channels.clear();
        }
    }

    /// Publish the live instance counts of the given registry.
    fn publish_counts(&self, counts: BTreeMap<String, u32>) {
        for stage in self.inner.ctx.flow.stages.iter() {
            let count = counts.get(&stage.name).copied().unwrap_or(0);
            metrics::gauge!(METRIC_STAGE_INSTANCES, count as f64, "stage" => stage.name.clone());
        }
        self.inner.counts.store(Arc::new(counts));
    }

    fn listeners(&self) -> StdMutexGuard<'_, Listeners> {
        match self.inner.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Deliver transitions to a listener until a terminal transition has been handled.
async fn run_listener<L: ProgramListener>(listener: L, rx: mpsc::UnboundedReceiver<StateTransition>) {
    let mut transitions = UnboundedReceiverStream::new(rx);
    while let Some(transition) = transitions.next().await {
        let is_terminal = transition.from.is_some() && transition.to.is_terminal();
        listener.on_transition(transition).await;
        if is_terminal {
            break;
        }
    }
}

fn now_secs() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
