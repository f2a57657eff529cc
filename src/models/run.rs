//! Run lifecycle models.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{ProgramRunId, RunId};

/// The system argument carrying an instance's ID within its stage.
pub const ARG_INSTANCE_ID: &str = "instanceId";
/// The system argument carrying the total instance count of a stage.
pub const ARG_INSTANCES: &str = "instances";
/// The system argument carrying the ID of the run.
pub const ARG_RUN_ID: &str = "runId";

/// The address of a single stage instance within a run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageKey {
    pub stage: Arc<String>,
    pub instance_id: u32,
}

impl StageKey {
    /// Create a new instance.
    pub fn new(stage: impl Into<String>, instance_id: u32) -> Self {
        Self {
            stage: Arc::new(stage.into()),
            instance_id,
        }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stage, self.instance_id)
    }
}

/// The options of a single program run.
#[derive(Clone, Debug)]
pub struct ProgramOptions {
    /// The ID of the run.
    pub run_id: RunId,
    /// System arguments, set by the platform.
    pub system_args: BTreeMap<String, String>,
    /// User arguments, which may be scoped per stage.
    pub user_args: BTreeMap<String, String>,
}

impl ProgramOptions {
    /// Create options for a new run with the given user arguments.
    pub fn new(user_args: BTreeMap<String, String>) -> Self {
        Self {
            run_id: RunId::generate(),
            system_args: Default::default(),
            user_args,
        }
    }
}

/// The states of a program run's aggregate controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgramState {
    Starting,
    Alive,
    Suspending,
    Suspended,
    Resuming,
    Stopping,
    Stopped,
    Error,
}

impl ProgramState {
    /// Check if this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl fmt::Display for ProgramState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let val = match self {
            Self::Starting => "starting",
            Self::Alive => "alive",
            Self::Suspending => "suspending",
            Self::Suspended => "suspended",
            Self::Resuming => "resuming",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(val)
    }
}

/// A state transition of a program run.
#[derive(Clone, Debug, PartialEq)]
pub struct StateTransition {
    /// The previous state, `None` for the initial notification delivered to a new listener.
    pub from: Option<ProgramState>,
    /// The new state.
    pub to: ProgramState,
    /// The failure which caused a transition into the error state.
    pub cause: Option<Arc<String>>,
    /// Unix timestamp in seconds of the transition.
    pub at_secs: i64,
}

/// The status of a run as recorded in the run record store.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Killed,
    Failed,
}

/// The durable record of a program run.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RunRecord {
    pub run: ProgramRunId,
    pub start_secs: i64,
    #[serde(default)]
    pub stop_secs: Option<i64>,
    pub status: RunStatus,
    #[serde(default)]
    pub failure: Option<String>,
    #[serde(default)]
    pub system_args: BTreeMap<String, String>,
    #[serde(default)]
    pub user_args: BTreeMap<String, String>,
}

/// A command issued to a program run's aggregate controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgramCommand {
    /// Change the number of instances of a stage.
    Rescale { stage: String, instances: u32 },
}

/// A command issued to a single stage instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceCommand {
    /// The total instance count of the instance's stage has changed.
    Instances(u32),
}
