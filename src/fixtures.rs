//! Shared test fixtures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::controller::FlowController;
use crate::instance::{InstanceController, InstanceFactory, InstanceOptions, InstanceRef, InstanceState};
use crate::listener::ProgramListener;
use crate::models::{
    ApplicationSpec, ConnectionSource, FlowConnection, FlowSpec, InstanceCommand, Program, ProgramId, ProgramOptions, ProgramRunId, RunRecord, RunStatus,
    StageKey, StageSpec, StateTransition, DEFAULT_STAGE_OUTPUT,
};
use crate::queue::memory::InMemoryPartitioner;
use crate::queue::{ConsumerGroup, ConsumerGroupId, QueueName, QueuePartitioner};
use crate::runner::FlowProgramRunner;
use crate::store::{RetryPolicy, RunRecordStore};

pub const APPLICATION: &str = "purchases";
pub const FLOW: &str = "purchase-flow";
pub const STREAM: &str = "purchases";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("fixture lock poisoned")
}

/// A call observed by a mock collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Start(StageKey),
    Suspend(StageKey),
    Resume(StageKey),
    Stop(StageKey),
    Command(StageKey, InstanceCommand),
    BindQueues(Vec<String>),
    Repartition { stage: String, partitions: u32 },
}

/// An ordered log of calls shared by mock collaborators.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn push(&self, call: Call) {
        lock(&self.0).push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.0).clone()
    }

    pub fn clear(&self) {
        lock(&self.0).clear();
    }
}

/// A mock instance controller recording every call it receives.
pub struct MockInstance {
    key: StageKey,
    log: CallLog,
    state: Mutex<InstanceState>,
    instances: Mutex<Option<u32>>,
    fail_suspend: AtomicBool,
    fail_resume: AtomicBool,
    fail_stop: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MockInstance {
    pub fn new(key: StageKey, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            key,
            log,
            state: Mutex::new(InstanceState::Alive),
            instances: Mutex::new(None),
            fail_suspend: AtomicBool::new(false),
            fail_resume: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            delay: Mutex::new(None),
        })
    }

    pub fn into_ref(self: Arc<Self>) -> InstanceRef {
        self
    }

    pub fn fail_suspend(&self) {
        self.fail_suspend.store(true, Ordering::SeqCst);
    }

    pub fn fail_resume(&self) {
        self.fail_resume.store(true, Ordering::SeqCst);
    }

    pub fn fail_stop(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }

    /// Delay every lifecycle call by the given duration.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// The last instance count delivered to this instance.
    pub fn instances(&self) -> Option<u32> {
        *lock(&self.instances)
    }

    async fn observe(&self, call: Call) {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.log.push(call);
    }
}

#[async_trait]
impl InstanceController for MockInstance {
    fn key(&self) -> &StageKey {
        &self.key
    }

    fn state(&self) -> InstanceState {
        *lock(&self.state)
    }

    async fn suspend(&self) -> Result<()> {
        self.observe(Call::Suspend(self.key.clone())).await;
        if self.fail_suspend.load(Ordering::SeqCst) {
            bail!("injected suspend failure of {}", self.key);
        }
        *lock(&self.state) = InstanceState::Suspended;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.observe(Call::Resume(self.key.clone())).await;
        if self.fail_resume.load(Ordering::SeqCst) {
            bail!("injected resume failure of {}", self.key);
        }
        *lock(&self.state) = InstanceState::Alive;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.observe(Call::Stop(self.key.clone())).await;
        if self.fail_stop.load(Ordering::SeqCst) {
            bail!("injected stop failure of {}", self.key);
        }
        *lock(&self.state) = InstanceState::Stopped;
        Ok(())
    }

    async fn command(&self, command: InstanceCommand) -> Result<()> {
        self.observe(Call::Command(self.key.clone(), command)).await;
        let InstanceCommand::Instances(count) = command;
        *lock(&self.instances) = Some(count);
        Ok(())
    }
}

/// A mock instance factory producing mock instances.
pub struct MockFactory {
    log: CallLog,
    fail_on: Mutex<Option<StageKey>>,
    started: Mutex<BTreeMap<StageKey, Arc<MockInstance>>>,
    options: Mutex<Vec<InstanceOptions>>,
}

impl MockFactory {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail_on: Mutex::new(None),
            started: Default::default(),
            options: Default::default(),
        }
    }

    /// Fail the start of the given instance.
    pub fn fail_on(&self, key: StageKey) {
        *lock(&self.fail_on) = Some(key);
    }

    /// The most recently started instance with the given key.
    pub fn instance(&self, key: &StageKey) -> Option<Arc<MockInstance>> {
        lock(&self.started).get(key).cloned()
    }

    /// The options of every successful start, in order.
    pub fn options(&self) -> Vec<InstanceOptions> {
        lock(&self.options).clone()
    }
}

#[async_trait]
impl InstanceFactory for MockFactory {
    async fn start(&self, options: InstanceOptions) -> Result<InstanceRef> {
        self.log.push(Call::Start(options.key.clone()));
        if lock(&self.fail_on).as_ref() == Some(&options.key) {
            bail!("injected start failure of {}", options.key);
        }
        let instance = MockInstance::new(options.key.clone(), self.log.clone());
        lock(&self.started).insert(options.key.clone(), instance.clone());
        lock(&self.options).push(options);
        Ok(instance.into_ref())
    }
}

/// A partitioner recording its calls over an in-memory partitioner.
pub struct MockPartitioner {
    log: CallLog,
    inner: InMemoryPartitioner,
    fail_repartition: AtomicBool,
}

impl MockPartitioner {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            inner: InMemoryPartitioner::default(),
            fail_repartition: AtomicBool::new(false),
        }
    }

    pub fn fail_repartition(&self) {
        self.fail_repartition.store(true, Ordering::SeqCst);
    }

    pub fn partitions(&self) -> &InMemoryPartitioner {
        &self.inner
    }
}

#[async_trait]
impl QueuePartitioner for MockPartitioner {
    async fn bind_queues(&self, groups: &[ConsumerGroup]) -> Result<()> {
        self.log.push(Call::BindQueues(groups.iter().map(|group| group.stage.clone()).collect()));
        self.inner.bind_queues(groups).await
    }

    async fn repartition(&self, stage: &str, group_id: ConsumerGroupId, queues: &[QueueName], partitions: u32) -> Result<()> {
        self.log.push(Call::Repartition {
            stage: stage.into(),
            partitions,
        });
        if self.fail_repartition.load(Ordering::SeqCst) {
            bail!("injected repartition failure of stage '{}'", stage);
        }
        self.inner.repartition(stage, group_id, queues, partitions).await
    }
}

/// An in-memory run record store with injectable write failures.
#[derive(Default)]
pub struct MockRunRecordStore {
    records: Mutex<HashMap<ProgramRunId, RunRecord>>,
    /// The number of upcoming writes to fail.
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl MockRunRecordStore {
    /// Fail the next `count` write attempts.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// The total number of write attempts observed.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn record(&self, run: &ProgramRunId) -> Option<RunRecord> {
        lock(&self.records).get(run).cloned()
    }

    fn write<F: FnOnce(&mut HashMap<ProgramRunId, RunRecord>) -> Result<()>>(&self, f: F) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            bail!("injected store failure");
        }
        f(&mut *lock(&self.records))
    }
}

#[async_trait]
impl RunRecordStore for MockRunRecordStore {
    async fn set_start(
        &self, run: &ProgramRunId, start_secs: i64, system_args: &BTreeMap<String, String>, user_args: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.write(|records| {
            records.insert(
                run.clone(),
                RunRecord {
                    run: run.clone(),
                    start_secs,
                    stop_secs: None,
                    status: RunStatus::Running,
                    failure: None,
                    system_args: system_args.clone(),
                    user_args: user_args.clone(),
                },
            );
            Ok(())
        })
    }

    async fn set_stop(&self, run: &ProgramRunId, stop_secs: i64, status: RunStatus, failure: Option<&str>) -> Result<()> {
        self.write(|records| {
            let record = records.get_mut(run).ok_or_else(|| anyhow!("unknown run {}", run))?;
            record.stop_secs = Some(stop_secs);
            record.status = status;
            record.failure = failure.map(String::from);
            Ok(())
        })
    }

    async fn set_suspend(&self, run: &ProgramRunId) -> Result<()> {
        self.write(|records| {
            let record = records.get_mut(run).ok_or_else(|| anyhow!("unknown run {}", run))?;
            record.status = RunStatus::Suspended;
            Ok(())
        })
    }

    async fn set_resume(&self, run: &ProgramRunId) -> Result<()> {
        self.write(|records| {
            let record = records.get_mut(run).ok_or_else(|| anyhow!("unknown run {}", run))?;
            record.status = RunStatus::Running;
            Ok(())
        })
    }

    async fn get(&self, run: &ProgramRunId) -> Result<Option<RunRecord>> {
        Ok(self.record(run))
    }
}

/// A listener recording every transition it observes.
#[derive(Clone, Default)]
pub struct RecordingListener(Arc<Mutex<Vec<StateTransition>>>);

impl RecordingListener {
    pub fn transitions(&self) -> Vec<StateTransition> {
        lock(&self.0).clone()
    }
}

#[async_trait]
impl ProgramListener for RecordingListener {
    async fn on_transition(&self, transition: StateTransition) {
        lock(&self.0).push(transition);
    }
}

/// Build a linear flow reading from the purchases stream, with the given stages & instance counts.
pub fn flow_spec(stages: &[(&str, u32)]) -> FlowSpec {
    let mut connections = vec![];
    let mut prev: Option<&str> = None;
    for (name, _) in stages.iter().copied() {
        let from = match prev {
            None => ConnectionSource::Stream(STREAM.into()),
            Some(prev) => ConnectionSource::Stage(prev.into()),
        };
        connections.push(FlowConnection {
            from,
            to: name.into(),
            output: DEFAULT_STAGE_OUTPUT.into(),
        });
        prev = Some(name);
    }
    FlowSpec {
        name: FLOW.into(),
        stages: stages
            .iter()
            .map(|(name, instances)| StageSpec {
                name: (*name).into(),
                instances: *instances,
                args: Default::default(),
            })
            .collect(),
        connections,
    }
}

/// Build a program running the given flow.
pub fn program(flow: FlowSpec) -> Program {
    Program {
        id: ProgramId::flow("default", APPLICATION, FLOW),
        application: Arc::new(ApplicationSpec {
            namespace: "default".into(),
            name: APPLICATION.into(),
            flows: vec![flow],
        }),
    }
}

/// A runner wired to mock collaborators sharing one call log.
pub struct Harness {
    pub log: CallLog,
    pub factory: Arc<MockFactory>,
    pub partitioner: Arc<MockPartitioner>,
    pub store: Arc<MockRunRecordStore>,
    pub runner: FlowProgramRunner,
}

impl Harness {
    pub fn new() -> Self {
        let log = CallLog::default();
        let factory = Arc::new(MockFactory::new(log.clone()));
        let partitioner = Arc::new(MockPartitioner::new(log.clone()));
        let store = Arc::new(MockRunRecordStore::default());
        let runner = FlowProgramRunner::new(
            factory.clone(),
            partitioner.clone(),
            store.clone(),
            RetryPolicy::fixed_delay(Duration::from_millis(1), 3),
            None,
        );
        Self {
            log,
            factory,
            partitioner,
            store,
            runner,
        }
    }

    /// Start a run of a linear flow with the given stages, clearing the call log once started.
    pub async fn start(&self, stages: &[(&str, u32)]) -> Result<FlowController> {
        let program = program(flow_spec(stages));
        let controller = self.runner.run(&program, ProgramOptions::new(Default::default())).await?;
        self.log.clear();
        Ok(controller)
    }

    /// The started mock instance with the given key.
    pub fn instance(&self, stage: &str, instance_id: u32) -> Arc<MockInstance> {
        self.factory
            .instance(&StageKey::new(stage, instance_id))
            .unwrap_or_else(|| panic!("expected instance {}#{} to have been started", stage, instance_id))
    }
}
