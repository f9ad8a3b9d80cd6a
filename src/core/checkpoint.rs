use std::collections::BTreeMap;

use super::environment::{Environment, GlucoseSimulator, Snapshot};
use super::error::{Result, WizardError};
use super::types::SegmentIndex;

/// Pre-segment environment snapshots, keyed by segment.
#[derive(Debug)]
pub struct CheckpointStore<S> {
    snapshots: BTreeMap<SegmentIndex, Snapshot<S>>,
}

impl<S> Default for CheckpointStore<S> {
    fn default() -> Self {
        Self {
            snapshots: BTreeMap::new(),
        }
    }
}

impl<S: GlucoseSimulator> CheckpointStore<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins.
    pub fn save(&mut self, segment: SegmentIndex, env: &Environment<S>) {
        self.snapshots.insert(segment, env.snapshot());
    }

    pub fn restore(&self, segment: SegmentIndex) -> Result<Environment<S>> {
        self.snapshots
            .get(&segment)
            .map(Snapshot::restore)
            .ok_or(WizardError::NoCheckpoint(segment))
    }

    pub fn contains(&self, segment: SegmentIndex) -> bool {
        self.snapshots.contains_key(&segment)
    }

    pub fn segments(&self) -> impl Iterator<Item = SegmentIndex> + '_ {
        self.snapshots.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::environment::PendingEnvironment;
    use crate::core::environment::testing::LinearSimulator;

    fn fresh_env(initial: f64) -> Environment<LinearSimulator> {
        PendingEnvironment::new(LinearSimulator::new(initial, vec![5.0; 200]))
            .reset()
            .0
    }

    #[test]
    fn restore_without_save_is_a_checkpoint_error() {
        let store = CheckpointStore::<LinearSimulator>::new();
        let err = store
            .restore(SegmentIndex::FIRST)
            .expect_err("nothing saved");
        assert!(matches!(err, WizardError::NoCheckpoint(seg) if seg == SegmentIndex::FIRST));
    }

    #[test]
    fn restored_environments_replay_identically() {
        let mut env = fresh_env(130.0);
        let mut store = CheckpointStore::new();
        store.save(SegmentIndex::FIRST, &env);

        let direct = (0..20)
            .map(|_| env.step(0.02, 0.0).observation.glucose)
            .collect::<Vec<_>>();

        for _ in 0..2 {
            let mut replay = store.restore(SegmentIndex::FIRST).expect("saved");
            let replayed = (0..20)
                .map(|_| replay.step(0.02, 0.0).observation.glucose)
                .collect::<Vec<_>>();
            assert_eq!(direct, replayed);
        }
    }

    #[test]
    fn save_overwrites_previous_snapshot_for_same_segment() {
        let mut env = fresh_env(100.0);
        let mut store = CheckpointStore::new();
        store.save(SegmentIndex::FIRST, &env);
        env.step(0.0, 0.0);
        env.step(0.0, 0.0);
        store.save(SegmentIndex::FIRST, &env);

        let restored = store.restore(SegmentIndex::FIRST).expect("saved");
        assert_eq!(restored.steps_taken(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clear_drops_every_segment() {
        let env = fresh_env(100.0);
        let mut store = CheckpointStore::new();
        for segment in SegmentIndex::all() {
            store.save(segment, &env);
        }
        assert_eq!(store.segments().count(), 3);
        store.clear();
        assert!(store.is_empty());
        assert!(!store.contains(SegmentIndex::LAST));
    }
}
