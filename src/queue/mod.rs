//! Stage consumer queues & partitioning.
//!
//! Every stage which consumes data does so through a single consumer group spanning all of the
//! stage's input queues. The consumer group is divided into exactly one partition per stage
//! instance, and instance `n` consumes partition `n`.

pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{ConnectionSource, FlowSpec, ProgramId};

/// The ID of a stage's consumer group.
pub type ConsumerGroupId = u64;

/// The name of a queue consumed by a stage.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// The name of the queue of an external stream.
    pub fn from_stream(stream: &str) -> Self {
        Self(format!("stream:///{}", stream))
    }

    /// The name of the queue of a stage's output.
    pub fn from_stage(program: &ProgramId, stage: &str, output: &str) -> Self {
        Self(format!("queue:///{}/{}/{}/{}", program.application, program.name, stage, output))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the stable ID of the consumer group of a stage.
pub fn consumer_group_id(program: &ProgramId, stage: &str) -> ConsumerGroupId {
    let name = format!("{}.{}.{}.{}", program.namespace, program.application, program.name, stage);
    seahash::hash(name.as_bytes())
}

/// The queues consumed by each stage of a flow.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConsumerQueueBinding {
    stages: BTreeMap<String, BTreeSet<QueueName>>,
}

impl ConsumerQueueBinding {
    /// Build the binding of the given flow from its connections.
    pub fn configure(program: &ProgramId, flow: &FlowSpec) -> Self {
        let mut stages: BTreeMap<String, BTreeSet<QueueName>> = BTreeMap::new();
        for conn in flow.connections.iter() {
            let queue = match &conn.from {
                ConnectionSource::Stream(stream) => QueueName::from_stream(stream),
                ConnectionSource::Stage(stage) => QueueName::from_stage(program, stage, &conn.output),
            };
            stages.entry(conn.to.clone()).or_default().insert(queue);
        }
        Self { stages }
    }

    /// The queues consumed by the given stage.
    pub fn queues(&self, stage: &str) -> Vec<QueueName> {
        self.stages.get(stage).map(|queues| queues.iter().cloned().collect()).unwrap_or_default()
    }

    /// The consumer groups of every consuming stage, partitioned by the flow's declared instances.
    pub fn consumer_groups(&self, program: &ProgramId, flow: &FlowSpec) -> Vec<ConsumerGroup> {
        flow.stages
            .iter()
            .filter(|stage| self.stages.contains_key(&stage.name))
            .map(|stage| ConsumerGroup {
                stage: stage.name.clone(),
                group_id: consumer_group_id(program, &stage.name),
                partitions: stage.instances,
                queues: self.queues(&stage.name),
            })
            .collect()
    }
}

/// A stage's consumer group across its input queues.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerGroup {
    pub stage: String,
    pub group_id: ConsumerGroupId,
    pub partitions: u32,
    pub queues: Vec<QueueName>,
}

/// The queue system's partition management interface.
///
/// Both operations mutate partition metadata only, are idempotent, and are safe to call while
/// the affected stage's instances are suspended.
#[async_trait]
pub trait QueuePartitioner: Send + Sync + 'static {
    /// Provision the given consumer groups on their queues.
    async fn bind_queues(&self, groups: &[ConsumerGroup]) -> Result<()>;

    /// Reassign the partitions of a stage's consumer group to the given instance count.
    async fn repartition(&self, stage: &str, group_id: ConsumerGroupId, queues: &[QueueName], partitions: u32) -> Result<()>;
}
