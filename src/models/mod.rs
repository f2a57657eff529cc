//! Data models.

pub mod args;
mod program;
mod run;

pub use program::{
    ApplicationSpec, ConnectionSource, FlowConnection, FlowSpec, Program, ProgramId, ProgramRunId, ProgramType, RunId, StageSpec, DEFAULT_NAMESPACE,
    DEFAULT_STAGE_OUTPUT,
};
pub use run::{
    InstanceCommand, ProgramCommand, ProgramOptions, ProgramState, RunRecord, RunStatus, StageKey, StateTransition, ARG_INSTANCES, ARG_INSTANCE_ID, ARG_RUN_ID,
};
