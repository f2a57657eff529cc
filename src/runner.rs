//! Flow program runner.
//!
//! The runner starts every instance of a flow, all or nothing, and hands back the controller of
//! the new run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::controller::{self, FlowContext, FlowController};
use crate::error::AppError;
use crate::fanout::{fan_out, InstanceOp};
use crate::instance::{InstanceFactory, InstanceOptions};
use crate::listener::RunRecordListener;
use crate::models::{FlowSpec, Program, ProgramOptions, ProgramRunId, ProgramType};
use crate::queue::{ConsumerQueueBinding, QueuePartitioner};
use crate::registry::ControllerRegistry;
use crate::store::{RetryPolicy, RunRecordStore};

/// A runner of flow programs.
pub struct FlowProgramRunner {
    factory: Arc<dyn InstanceFactory>,
    partitioner: Arc<dyn QueuePartitioner>,
    store: Arc<dyn RunRecordStore>,
    retry: RetryPolicy,
    fanout_timeout: Option<Duration>,
}

impl FlowProgramRunner {
    /// Create a new instance.
    pub fn new(
        factory: Arc<dyn InstanceFactory>, partitioner: Arc<dyn QueuePartitioner>, store: Arc<dyn RunRecordStore>, retry: RetryPolicy,
        fanout_timeout: Option<Duration>,
    ) -> Self {
        controller::register_metrics();
        Self {
            factory,
            partitioner,
            store,
            retry,
            fanout_timeout,
        }
    }

    /// Start a new run of the given flow program.
    ///
    /// Every instance of every stage is started before this returns. If any instance fails to
    /// start, every instance already started is stopped and no controller is returned.
    #[tracing::instrument(level = "debug", skip(self, program, options), fields(program = %program.id, run = %options.run_id))]
    pub async fn run(&self, program: &Program, options: ProgramOptions) -> Result<FlowController> {
        let flow = Self::validate(program)?;
        let run = ProgramRunId {
            program: program.id.clone(),
            run: options.run_id,
        };
        tracing::info!("starting flow {}", run);

        let queues = ConsumerQueueBinding::configure(&program.id, &flow);
        self.partitioner
            .bind_queues(&queues.consumer_groups(&program.id, &flow))
            .await
            .with_context(|| format!("error binding queues of flow {}", run))?;

        let registry = self.start_instances(&run, &flow, &options).await?;
        tracing::info!(instances = registry.len(), "all instances of flow {} started", run);

        let controller = FlowController::new(
            FlowContext {
                run: run.clone(),
                flow,
                options: options.clone(),
                factory: self.factory.clone(),
                partitioner: self.partitioner.clone(),
                fanout_timeout: self.fanout_timeout,
            },
            registry,
            queues,
        );
        controller.add_listener(RunRecordListener::new(self.store.clone(), run, options, self.retry));
        Ok(controller)
    }

    /// Validate that the program is a runnable flow, returning its spec.
    fn validate(program: &Program) -> Result<Arc<FlowSpec>> {
        if program.id.program_type != ProgramType::Flow {
            bail!(AppError::InvalidInput(format!(
                "program {} is a {}, only flows may be run by a flow runner",
                program.id, program.id.program_type
            )));
        }
        let flow = program.application.flow(&program.id.name).ok_or_else(|| {
            AppError::InvalidInput(format!(
                "flow '{}' is not declared by application '{}'",
                program.id.name, program.application.name
            ))
        })?;
        flow.validate()?;
        Ok(Arc::new(flow.clone()))
    }

    /// Start every declared instance of the flow.
    ///
    /// Instances are started one at a time in declaration order. On the first failure, every
    /// instance already started is stopped best-effort.
    async fn start_instances(&self, run: &ProgramRunId, flow: &FlowSpec, options: &ProgramOptions) -> Result<ControllerRegistry> {
        let mut registry = ControllerRegistry::default();
        for stage in flow.stages.iter() {
            for instance_id in 0..stage.instances {
                let instance_options = InstanceOptions::for_stage(&run.program, options, stage, instance_id, stage.instances);
                let key = instance_options.key.clone();
                match self.factory.start(instance_options).await {
                    Ok(ctl) => {
                        tracing::debug!(instance = %key, "instance started");
                        registry.insert(key, ctl);
                    }
                    Err(err) => {
                        tracing::error!(error = ?err, instance = %key, "error starting instance, stopping {} started instances of flow {}", registry.len(), run);
                        fan_out(InstanceOp::Stop, registry.drain(), self.fanout_timeout).await;
                        let err = err.context(format!("error starting instance {}", key));
                        return Err(AppError::StartupFailed(err).into());
                    }
                }
            }
        }
        Ok(registry)
    }
}
