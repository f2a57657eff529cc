//! Stage instance controllers.
//!
//! An instance controller is the control handle of a single running replica of a stage. The
//! engine which actually executes the stage's processing lives behind this interface; the flow
//! runtime only drives its lifecycle.

pub mod local;
#[cfg(test)]
mod local_test;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::args::resolve_stage_args;
use crate::models::{InstanceCommand, ProgramId, ProgramOptions, RunId, StageKey, StageSpec, ARG_INSTANCES, ARG_INSTANCE_ID, ARG_RUN_ID};

/// The lifecycle state of a single stage instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    Alive,
    Suspended,
    Stopped,
    Error,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alive => f.write_str("alive"),
            Self::Suspended => f.write_str("suspended"),
            Self::Stopped => f.write_str("stopped"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// The control handle of a single running stage instance.
///
/// Implementations must be safe to invoke concurrently from different tasks.
#[async_trait]
pub trait InstanceController: Send + Sync + 'static {
    /// The address of this instance within its run.
    fn key(&self) -> &StageKey;

    /// The current state of this instance.
    fn state(&self) -> InstanceState;

    /// Suspend processing, retaining any consumer position.
    async fn suspend(&self) -> Result<()>;

    /// Resume processing after a suspend.
    async fn resume(&self) -> Result<()>;

    /// Stop this instance permanently.
    async fn stop(&self) -> Result<()>;

    /// Deliver a command to this instance.
    async fn command(&self, command: InstanceCommand) -> Result<()>;
}

/// A shared instance controller handle.
pub type InstanceRef = Arc<dyn InstanceController>;

/// A type capable of starting new stage instances.
#[async_trait]
pub trait InstanceFactory: Send + Sync + 'static {
    /// Start a new instance, returning once it has started.
    async fn start(&self, options: InstanceOptions) -> Result<InstanceRef>;
}

/// The options used to start a single stage instance.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceOptions {
    /// The program to which this instance belongs.
    pub program: ProgramId,
    /// The run to which this instance belongs.
    pub run_id: RunId,
    /// The address of this instance.
    pub key: StageKey,
    /// The total number of instances of this instance's stage.
    pub instances: u32,
    /// System arguments, including the instance ID & count.
    pub system_args: BTreeMap<String, String>,
    /// User arguments resolved for this instance's stage.
    pub user_args: BTreeMap<String, String>,
}

impl InstanceOptions {
    /// Create the options of an instance.
    pub fn new(
        program: ProgramId, run_id: RunId, key: StageKey, instances: u32, system_args: &BTreeMap<String, String>, user_args: BTreeMap<String, String>,
    ) -> Self {
        let mut system_args = system_args.clone();
        system_args.insert(ARG_RUN_ID.into(), run_id.to_string());
        system_args.insert(ARG_INSTANCE_ID.into(), key.instance_id.to_string());
        system_args.insert(ARG_INSTANCES.into(), instances.to_string());
        Self {
            program,
            run_id,
            key,
            instances,
            system_args,
            user_args,
        }
    }

    /// Create the options of an instance of the given stage within a run.
    ///
    /// The run's user arguments are resolved against the stage's declared arguments.
    pub fn for_stage(program: &ProgramId, options: &ProgramOptions, stage: &StageSpec, instance_id: u32, instances: u32) -> Self {
        let user_args = resolve_stage_args(&stage.name, &stage.args, &options.user_args);
        Self::new(
            program.clone(),
            options.run_id,
            StageKey::new(stage.name.clone(), instance_id),
            instances,
            &options.system_args,
            user_args,
        )
    }
}
