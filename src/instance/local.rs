//! In-process stage instances.
//!
//! Each local instance is a controller task which owns the instance's lifecycle state and its
//! partition assignment. The partition owned by an instance is always its instance ID within the
//! stage's current instance count.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::instance::{InstanceController, InstanceFactory, InstanceOptions, InstanceRef, InstanceState};
use crate::models::{InstanceCommand, StageKey};

const ERR_INSTANCE_GONE: &str = "instance controller is no longer running";

/// A factory of in-process stage instances.
pub struct LocalInstanceFactory {
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
}

impl LocalInstanceFactory {
    /// Create a new instance.
    pub fn new(shutdown_tx: broadcast::Sender<()>) -> Self {
        Self { shutdown_tx }
    }
}

#[async_trait]
impl InstanceFactory for LocalInstanceFactory {
    #[tracing::instrument(level = "debug", skip(self, options), fields(instance = %options.key))]
    async fn start(&self, options: InstanceOptions) -> Result<InstanceRef> {
        if options.key.instance_id >= options.instances {
            bail!("instance {} is outside of the stage's instance count {}", options.key, options.instances);
        }
        let (tx, rx) = mpsc::channel(100);
        let status = LocalInstanceStatus {
            state: InstanceState::Alive,
            instances: options.instances,
        };
        let (status_tx, status_rx) = watch::channel(status);
        let key = options.key.clone();
        let handle = LocalInstanceCtl::new(options, rx, status_tx, self.shutdown_tx.subscribe()).spawn();
        Ok(Arc::new(LocalInstance {
            key,
            tx,
            status: status_rx,
            handle: Mutex::new(Some(handle)),
        }))
    }
}

/// A point-in-time view of a local instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalInstanceStatus {
    pub state: InstanceState,
    /// The stage instance count this instance has been told about.
    pub instances: u32,
}

/// The control handle of a local instance.
pub struct LocalInstance {
    key: StageKey,
    tx: mpsc::Sender<LocalInstanceMsg>,
    status: watch::Receiver<LocalInstanceStatus>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LocalInstance {
    /// The current status of this instance.
    pub fn status(&self) -> LocalInstanceStatus {
        *self.status.borrow()
    }

    async fn request(&self, op: LocalInstanceOp) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(LocalInstanceMsg { op, tx })
            .await
            .map_err(|_| anyhow!(ERR_INSTANCE_GONE))
            .with_context(|| format!("error sending {:?} to {}", op, self.key))?;
        rx.await.map_err(|_| anyhow!(ERR_INSTANCE_GONE))?
    }
}

#[async_trait]
impl InstanceController for LocalInstance {
    fn key(&self) -> &StageKey {
        &self.key
    }

    fn state(&self) -> InstanceState {
        self.status.borrow().state
    }

    async fn suspend(&self) -> Result<()> {
        self.request(LocalInstanceOp::Suspend).await
    }

    async fn resume(&self) -> Result<()> {
        self.request(LocalInstanceOp::Resume).await
    }

    async fn stop(&self) -> Result<()> {
        if self.state() == InstanceState::Stopped {
            return Ok(());
        }
        self.request(LocalInstanceOp::Stop).await?;
        let handle = self.handle.lock().ok().and_then(|mut handle| handle.take());
        if let Some(handle) = handle {
            handle.await.context("error joining instance controller task")?;
        }
        Ok(())
    }

    async fn command(&self, command: InstanceCommand) -> Result<()> {
        self.request(LocalInstanceOp::Command(command)).await
    }
}

#[derive(Clone, Copy, Debug)]
enum LocalInstanceOp {
    Suspend,
    Resume,
    Stop,
    Command(InstanceCommand),
}

struct LocalInstanceMsg {
    op: LocalInstanceOp,
    tx: oneshot::Sender<Result<()>>,
}

/// The controller task of a local instance.
struct LocalInstanceCtl {
    /// The options this instance was started with.
    options: InstanceOptions,
    /// A channel of lifecycle requests.
    requests: ReceiverStream<LocalInstanceMsg>,
    /// The published status of this instance.
    status_tx: watch::Sender<LocalInstanceStatus>,
    /// The current status of this instance.
    status: LocalInstanceStatus,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl LocalInstanceCtl {
    fn new(
        options: InstanceOptions, requests: mpsc::Receiver<LocalInstanceMsg>, status_tx: watch::Sender<LocalInstanceStatus>, shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let status = *status_tx.borrow();
        Self {
            options,
            requests: ReceiverStream::new(requests),
            status_tx,
            status,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
        }
    }

    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::debug!(
            partition = self.options.key.instance_id,
            instances = self.status.instances,
            "instance {} of {} has started",
            self.options.key,
            self.options.program
        );

        loop {
            tokio::select! {
                Some(msg) = self.requests.next() => {
                    let res = self.handle_op(msg.op);
                    let _res = msg.tx.send(res);
                    if self.status.state == InstanceState::Stopped {
                        break;
                    }
                }
                _ = self.shutdown_rx.next() => break,
                else => break,
            }
        }

        self.set_state(InstanceState::Stopped);
        tracing::debug!("instance {} has stopped", self.options.key);
    }

    fn handle_op(&mut self, op: LocalInstanceOp) -> Result<()> {
        match (op, self.status.state) {
            (LocalInstanceOp::Suspend, InstanceState::Alive) => self.set_state(InstanceState::Suspended),
            (LocalInstanceOp::Suspend, InstanceState::Suspended) => (),
            (LocalInstanceOp::Resume, InstanceState::Suspended) => self.set_state(InstanceState::Alive),
            (LocalInstanceOp::Resume, InstanceState::Alive) => (),
            (LocalInstanceOp::Stop, _) => self.set_state(InstanceState::Stopped),
            (LocalInstanceOp::Command(InstanceCommand::Instances(instances)), InstanceState::Alive | InstanceState::Suspended) => {
                if self.options.key.instance_id >= instances {
                    bail!("instance {} can not own a partition of {} instances", self.options.key, instances);
                }
                tracing::debug!(from = self.status.instances, to = instances, "instance {} instance count changed", self.options.key);
                self.status.instances = instances;
                let _res = self.status_tx.send(self.status);
            }
            (op, state) => bail!("can not apply {:?} to instance {} which is {}", op, self.options.key, state),
        }
        Ok(())
    }

    fn set_state(&mut self, state: InstanceState) {
        self.status.state = state;
        let _res = self.status_tx.send(self.status);
    }
}
