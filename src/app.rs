use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::controller::FlowController;
use crate::instance::local::LocalInstanceFactory;
use crate::loader::{FileSpecLoader, SpecLoader};
use crate::models::{ProgramOptions, ProgramState};
use crate::queue::memory::InMemoryPartitioner;
use crate::runner::FlowProgramRunner;
use crate::server::spawn_prom_server;
use crate::store::SledRunRecordStore;

/// The application object for when a flow is running as a process.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// The controller of the flow run.
    controller: FlowController,
    /// A channel of the flow run's state.
    state_rx: watch::Receiver<ProgramState>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// A channel used for tearing down any local instances left running after shutdown.
    instances_shutdown_tx: broadcast::Sender<()>,

    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance, starting the configured flow.
    pub async fn new(config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let store = SledRunRecordStore::new(config.clone()).await.context("error opening database")?;
        let loader = FileSpecLoader::open(&config.flow_spec_path).await?;
        let program = loader.load(&config.program_id()).await.context("error loading flow program")?;

        let (instances_shutdown_tx, _) = broadcast::channel(1);
        let runner = FlowProgramRunner::new(
            Arc::new(LocalInstanceFactory::new(instances_shutdown_tx.clone())),
            Arc::new(InMemoryPartitioner::default()),
            Arc::new(store),
            config.run_record_retry_policy(),
            config.fanout_timeout(),
        );
        let controller = runner
            .run(&program, ProgramOptions::new(Default::default()))
            .await
            .context("error starting flow")?;

        let metrics_server = spawn_prom_server(&config, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            state_rx: controller.watch_state(),
            controller,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            instances_shutdown_tx,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    break;
                }
                Ok(_) = self.state_rx.changed() => {
                    let state = *self.state_rx.borrow();
                    if state.is_terminal() {
                        tracing::info!(%state, "flow {} has ended", self.controller.run_id());
                        break;
                    }
                }
                _ = self.shutdown_rx.next() => break,
            }
        }
        let _ = self.shutdown_tx.send(());

        // Begin shutdown routine.
        tracing::debug!("flow runtime is shutting down");
        if !self.controller.state().is_terminal() {
            if let Err(err) = self.controller.stop().await {
                tracing::error!(error = ?err, "error stopping flow");
            }
        }
        self.controller.join_listeners().await;
        let _ = self.instances_shutdown_tx.send(());
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("flow runtime shutdown complete");
        Ok(())
    }
}
