use crate::fixtures::{CallLog, MockInstance};
use crate::models::StageKey;
use crate::registry::ControllerRegistry;

fn registry(stages: &[(&str, u32)]) -> ControllerRegistry {
    let log = CallLog::default();
    let mut registry = ControllerRegistry::default();
    for (stage, count) in stages.iter().copied() {
        for id in 0..count {
            let key = StageKey::new(stage, id);
            registry.insert(key.clone(), MockInstance::new(key, log.clone()).into_ref());
        }
    }
    registry
}

#[test]
fn counts_and_ids_track_inserts() {
    let registry = registry(&[("reader", 1), ("parser", 3)]);

    assert_eq!(registry.len(), 4);
    assert_eq!(registry.live_count("parser"), 3);
    assert_eq!(registry.live_count("writer"), 0);
    assert_eq!(registry.instance_ids("parser"), vec![0, 1, 2]);
    assert_eq!(registry.counts().get("reader"), Some(&1));
    assert!(registry.is_contiguous());

    let parser: Vec<_> = registry.stage("parser").into_iter().map(|(key, _)| key).collect();
    assert_eq!(parser, vec![StageKey::new("parser", 0), StageKey::new("parser", 1), StageKey::new("parser", 2)]);
    assert!(registry.get(&StageKey::new("parser", 2)).is_some());
}

#[test]
fn removing_last_instance_drops_stage() {
    let mut registry = registry(&[("reader", 1), ("parser", 2)]);

    assert!(registry.remove(&StageKey::new("reader", 0)).is_some());
    assert!(registry.remove(&StageKey::new("reader", 0)).is_none());

    assert!(registry.counts().get("reader").is_none());
    assert_eq!(registry.all().len(), 2);
}

#[test]
fn removing_middle_instance_breaks_contiguity() {
    let mut registry = registry(&[("parser", 3)]);

    registry.remove(&StageKey::new("parser", 1));

    assert!(!registry.is_contiguous());
    assert_eq!(registry.instance_ids("parser"), vec![0, 2]);
}

#[test]
fn drain_empties_registry() {
    let mut registry = registry(&[("reader", 1), ("parser", 2), ("writer", 3)]);

    let drained = registry.drain();

    assert_eq!(drained.len(), 6);
    assert!(registry.is_empty());
    assert!(registry.all().is_empty());
    assert!(drained.iter().all(|(key, ctl)| ctl.key() == key));
}
