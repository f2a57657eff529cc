//! An in-memory queue partitioner.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::queue::{ConsumerGroup, ConsumerGroupId, QueueName, QueuePartitioner};

/// A queue partitioner which tracks partition metadata in memory.
#[derive(Default)]
pub struct InMemoryPartitioner {
    state: Mutex<PartitionState>,
}

#[derive(Default)]
struct PartitionState {
    /// Partition counts by queue & consumer group.
    queues: HashMap<QueueName, HashMap<ConsumerGroupId, u32>>,
    /// Partition counts by stage.
    stages: HashMap<String, u32>,
}

impl InMemoryPartitioner {
    /// The number of partitions of the given consumer group on the given queue.
    pub fn partitions(&self, queue: &QueueName, group_id: ConsumerGroupId) -> Option<u32> {
        let state = self.state.lock().ok()?;
        state.queues.get(queue)?.get(&group_id).copied()
    }

    /// The number of partitions bound to the given stage.
    pub fn stage_partitions(&self, stage: &str) -> Option<u32> {
        let state = self.state.lock().ok()?;
        state.stages.get(stage).copied()
    }

    fn set_partitions(&self, stage: &str, group_id: ConsumerGroupId, queues: &[QueueName], partitions: u32) -> Result<()> {
        if partitions == 0 {
            bail!("consumer group of stage '{}' requires at least 1 partition", stage);
        }
        let mut state = self.state.lock().map_err(|_| anyhow!("partition state lock poisoned"))?;
        for queue in queues {
            state.queues.entry(queue.clone()).or_default().insert(group_id, partitions);
        }
        state.stages.insert(stage.to_string(), partitions);
        Ok(())
    }
}

#[async_trait]
impl QueuePartitioner for InMemoryPartitioner {
    async fn bind_queues(&self, groups: &[ConsumerGroup]) -> Result<()> {
        for group in groups {
            tracing::debug!(stage = %group.stage, partitions = group.partitions, queues = group.queues.len(), "binding consumer group");
            self.set_partitions(&group.stage, group.group_id, &group.queues, group.partitions)?;
        }
        Ok(())
    }

    async fn repartition(&self, stage: &str, group_id: ConsumerGroupId, queues: &[QueueName], partitions: u32) -> Result<()> {
        tracing::debug!(%stage, partitions, "repartitioning consumer group");
        self.set_partitions(stage, group_id, queues, partitions)
    }
}
