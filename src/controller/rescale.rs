//! Live rescaling of a single stage.
//!
//! Both directions hold the run's lock throughout. Only the named stage is touched; every other
//! stage keeps processing.
//!
//! Increase: suspend the stage's existing instances, repartition its consumer group to the new
//! count, tell the existing instances the new count, resume them, then start the new instances.
//!
//! Decrease: stop the excess instances, suspend the remaining ones, repartition, tell the
//! remaining instances the new count, then resume them.

use anyhow::{Context, Result};

use crate::controller::{FlowController, RunState};
use crate::fanout::{fan_out, InstanceOp};
use crate::instance::InstanceOptions;
use crate::models::{InstanceCommand, StageKey};
use crate::queue::consumer_group_id;

impl FlowController {
    /// Grow the stage from `live` to `target` instances.
    pub(super) async fn increase_instances(&self, state: &mut RunState, stage: &str, live: u32, target: u32) -> Result<()> {
        let ctx = &self.inner.ctx;
        let existing = state.registry.stage(stage);
        fan_out(InstanceOp::Suspend, existing.clone(), ctx.fanout_timeout).await;
        self.repartition(state, stage, target).await?;
        fan_out(InstanceOp::Command(InstanceCommand::Instances(target)), existing.clone(), ctx.fanout_timeout).await;
        fan_out(InstanceOp::Resume, existing, ctx.fanout_timeout).await;

        let spec = ctx
            .flow
            .stage(stage)
            .with_context(|| format!("stage '{}' is not declared by flow {}", stage, ctx.flow.name))?;
        for instance_id in live..target {
            let options = InstanceOptions::for_stage(&ctx.run.program, &ctx.options, spec, instance_id, target);
            let key = options.key.clone();
            let ctl = ctx
                .factory
                .start(options)
                .await
                .with_context(|| format!("error starting instance {}", key))?;
            tracing::debug!(instance = %key, "instance started");
            state.registry.insert(key, ctl);
        }
        Ok(())
    }

    /// Shrink the stage from `live` to `target` instances.
    pub(super) async fn decrease_instances(&self, state: &mut RunState, stage: &str, live: u32, target: u32) -> Result<()> {
        let ctx = &self.inner.ctx;
        let excess: Vec<_> = (target..live)
            .filter_map(|instance_id| {
                let key = StageKey::new(stage, instance_id);
                state.registry.remove(&key).map(|ctl| (key, ctl))
            })
            .collect();
        fan_out(InstanceOp::Stop, excess, ctx.fanout_timeout).await;

        let remaining = state.registry.stage(stage);
        fan_out(InstanceOp::Suspend, remaining.clone(), ctx.fanout_timeout).await;
        self.repartition(state, stage, target).await?;
        fan_out(InstanceOp::Command(InstanceCommand::Instances(target)), remaining.clone(), ctx.fanout_timeout).await;
        fan_out(InstanceOp::Resume, remaining, ctx.fanout_timeout).await;
        Ok(())
    }

    /// Repartition the stage's consumer group across its input queues.
    async fn repartition(&self, state: &RunState, stage: &str, partitions: u32) -> Result<()> {
        let program = &self.inner.ctx.run.program;
        let queues = state.queues.queues(stage);
        self.inner
            .ctx
            .partitioner
            .repartition(stage, consumer_group_id(program, stage), &queues, partitions)
            .await
            .with_context(|| format!("error repartitioning stage '{}' to {} partitions", stage, partitions))
    }
}
