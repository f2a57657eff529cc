//! Program identity & flow specification models.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The name of the default output of a stage, used when a connection does not name one.
pub const DEFAULT_STAGE_OUTPUT: &str = "out";
/// The default namespace of applications.
pub const DEFAULT_NAMESPACE: &str = "default";

/// The kinds of programs known to the runtime.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProgramType {
    Flow,
    Worker,
    Workflow,
    Service,
}

impl fmt::Display for ProgramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flow => write!(f, "flow"),
            Self::Worker => write!(f, "worker"),
            Self::Workflow => write!(f, "workflow"),
            Self::Service => write!(f, "service"),
        }
    }
}

/// The fully qualified identity of a program.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId {
    pub namespace: String,
    pub application: String,
    pub program_type: ProgramType,
    pub name: String,
}

impl ProgramId {
    /// Create a new instance.
    pub fn new(namespace: impl Into<String>, application: impl Into<String>, program_type: ProgramType, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            application: application.into(),
            program_type,
            name: name.into(),
        }
    }

    /// Create the ID of a flow program.
    pub fn flow(namespace: impl Into<String>, application: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(namespace, application, ProgramType::Flow, name)
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.namespace, self.application, self.program_type, self.name)
    }
}

/// The ID of a single run of a program.
///
/// Run IDs are never reused. The creation time of the run is carried along with the ID and is
/// used as the run's start time.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct RunId {
    pub id: Uuid,
    /// Unix timestamp in seconds of when this ID was generated.
    pub created_secs: i64,
}

impl RunId {
    /// Generate a new run ID.
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_secs: time::OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// The identity of a single run of a specific program.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct ProgramRunId {
    pub program: ProgramId,
    pub run: RunId,
}

impl fmt::Display for ProgramRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.program, self.run)
    }
}

/// A deployed application, the unit in which flows are declared.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ApplicationSpec {
    /// The namespace of this application.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// The name of this application.
    pub name: String,
    /// All flows declared by this application.
    #[serde(default)]
    pub flows: Vec<FlowSpec>,
}

impl ApplicationSpec {
    /// Get the spec of the named flow.
    pub fn flow(&self, name: &str) -> Option<&FlowSpec> {
        self.flows.iter().find(|flow| flow.name == name)
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.into()
}

/// The specification of a flow: a graph of stages connected by queues.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FlowSpec {
    /// The name of this flow, unique per application.
    pub name: String,
    /// The stages of this flow.
    pub stages: Vec<StageSpec>,
    /// The queue connections between streams & stages.
    #[serde(default)]
    pub connections: Vec<FlowConnection>,
}

impl FlowSpec {
    /// Get the spec of the named stage.
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Validate the structure of this flow.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            bail!("flow '{}' declares no stages", self.name);
        }
        let mut names = HashSet::new();
        for stage in self.stages.iter() {
            if stage.name.is_empty() {
                bail!("flow '{}' declares a stage with an empty name", self.name);
            }
            if !names.insert(stage.name.as_str()) {
                bail!("flow '{}' declares stage '{}' more than once", self.name, stage.name);
            }
            if stage.instances == 0 {
                bail!("stage '{}' of flow '{}' must declare at least 1 instance", stage.name, self.name);
            }
        }
        for conn in self.connections.iter() {
            if !names.contains(conn.to.as_str()) {
                bail!("flow '{}' connection targets unknown stage '{}'", self.name, conn.to);
            }
            if let ConnectionSource::Stage(source) = &conn.from {
                if !names.contains(source.as_str()) {
                    bail!("flow '{}' connection reads from unknown stage '{}'", self.name, source);
                }
            }
        }
        Ok(())
    }
}

/// The specification of a single flow stage.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct StageSpec {
    /// The name of this stage, unique per flow.
    pub name: String,
    /// The number of instances declared for this stage.
    #[serde(default = "default_instances")]
    pub instances: u32,
    /// Arguments declared for this stage, overridden by any run arguments of the same key.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

fn default_instances() -> u32 {
    1
}

/// A queue connection feeding a stage.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FlowConnection {
    /// The source of the connection's data.
    pub from: ConnectionSource,
    /// The name of the stage consuming the connection's data.
    pub to: String,
    /// The output of the source stage, only used for stage sources.
    #[serde(default = "default_output")]
    pub output: String,
}

fn default_output() -> String {
    DEFAULT_STAGE_OUTPUT.into()
}

/// The source side of a flow connection.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionSource {
    /// An external stream.
    Stream(String),
    /// The output of another stage of the same flow.
    Stage(String),
}

/// A loaded program ready to be run.
#[derive(Clone, Debug)]
pub struct Program {
    pub id: ProgramId,
    pub application: Arc<ApplicationSpec>,
}

impl Program {
    /// The stages of this program, if it is a flow declared by its application.
    pub fn stages(&self) -> Option<&[StageSpec]> {
        self.application.flow(&self.id.name).map(|flow| flow.stages.as_slice())
    }
}
