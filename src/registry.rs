//! The controller registry of a run.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::instance::InstanceRef;
use crate::models::StageKey;

/// All live instance controllers of a run, keyed by stage name & instance ID.
///
/// Outside of an in-flight rescale, the instance IDs of every stage form the contiguous range
/// `[0, count)`.
#[derive(Default)]
pub struct ControllerRegistry {
    stages: BTreeMap<String, BTreeMap<u32, InstanceRef>>,
}

impl ControllerRegistry {
    /// Register the controller of a started instance.
    ///
    /// Returns any controller previously registered under the same key.
    pub fn insert(&mut self, key: StageKey, controller: InstanceRef) -> Option<InstanceRef> {
        self.stages.entry(key.stage.as_ref().clone()).or_default().insert(key.instance_id, controller)
    }

    /// Remove the controller of the given instance.
    pub fn remove(&mut self, key: &StageKey) -> Option<InstanceRef> {
        let stage = self.stages.get_mut(key.stage.as_str())?;
        let controller = stage.remove(&key.instance_id);
        if stage.is_empty() {
            self.stages.remove(key.stage.as_str());
        }
        controller
    }

    /// Remove every controller of the registry.
    pub fn drain(&mut self) -> Vec<(StageKey, InstanceRef)> {
        let stages = std::mem::take(&mut self.stages);
        stages
            .into_iter()
            .flat_map(|(stage, instances)| {
                let stage = Arc::new(stage);
                instances.into_iter().map(move |(instance_id, ctl)| {
                    (
                        StageKey {
                            stage: stage.clone(),
                            instance_id,
                        },
                        ctl,
                    )
                })
            })
            .collect()
    }

    /// Get the controller of the given instance.
    pub fn get(&self, key: &StageKey) -> Option<&InstanceRef> {
        self.stages.get(key.stage.as_str())?.get(&key.instance_id)
    }

    /// The number of live instances of the given stage.
    pub fn live_count(&self, stage: &str) -> u32 {
        self.stages.get(stage).map(|instances| instances.len() as u32).unwrap_or(0)
    }

    /// The live instance IDs of the given stage, in ascending order.
    pub fn instance_ids(&self, stage: &str) -> Vec<u32> {
        self.stages.get(stage).map(|instances| instances.keys().copied().collect()).unwrap_or_default()
    }

    /// All live controllers of the given stage, in instance ID order.
    pub fn stage(&self, stage: &str) -> Vec<(StageKey, InstanceRef)> {
        let (name, instances) = match self.stages.get_key_value(stage) {
            Some((name, instances)) => (Arc::new(name.clone()), instances),
            None => return vec![],
        };
        instances
            .iter()
            .map(|(instance_id, ctl)| {
                (
                    StageKey {
                        stage: name.clone(),
                        instance_id: *instance_id,
                    },
                    ctl.clone(),
                )
            })
            .collect()
    }

    /// All live controllers of the registry.
    pub fn all(&self) -> Vec<(StageKey, InstanceRef)> {
        self.stages.keys().flat_map(|stage| self.stage(stage)).collect()
    }

    /// The live instance count of every stage.
    pub fn counts(&self) -> BTreeMap<String, u32> {
        self.stages.iter().map(|(stage, instances)| (stage.clone(), instances.len() as u32)).collect()
    }

    /// The total number of live instances across all stages.
    pub fn len(&self) -> usize {
        self.stages.values().map(|instances| instances.len()).sum()
    }

    /// Check if the registry holds no controllers.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Check that every stage's instance IDs are exactly `[0, count)`.
    pub fn is_contiguous(&self) -> bool {
        self.stages
            .values()
            .all(|instances| instances.keys().copied().eq(0..instances.len() as u32))
    }
}
