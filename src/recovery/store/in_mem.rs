//! Snapshot store with all data in memory.
//!
//! Useful for tests and for hosts that only need to survive logic
//! resets within one process.

use std::collections::BTreeMap;
use std::collections::HashMap;

use super::CheckpointStore;
use crate::errors::StageResult;
use crate::recovery::CheckpointSnapshot;
use crate::recovery::RecoveryBoundary;
use crate::recovery::StateBytes;
use crate::recovery::StepId;

#[derive(Debug, Default)]
pub struct InMemCheckpointStore {
    db: HashMap<StepId, BTreeMap<RecoveryBoundary, StateBytes>>,
}

impl InMemCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemCheckpointStore {
    fn write(&mut self, snapshot: &CheckpointSnapshot) -> StageResult<()> {
        tracing::trace!("Writing {} of {}", snapshot.boundary, snapshot.stage);
        self.db
            .entry(snapshot.stage.clone())
            .or_default()
            .insert(snapshot.boundary, snapshot.state.clone());
        Ok(())
    }

    fn load(
        &mut self,
        stage: &StepId,
        boundary: RecoveryBoundary,
    ) -> StageResult<Option<CheckpointSnapshot>> {
        Ok(self
            .db
            .get(stage)
            .and_then(|snaps| snaps.get(&boundary))
            .map(|state| CheckpointSnapshot {
                stage: stage.clone(),
                boundary,
                state: state.clone(),
            }))
    }

    fn latest(&mut self, stage: &StepId) -> StageResult<Option<CheckpointSnapshot>> {
        Ok(self
            .db
            .get(stage)
            .and_then(|snaps| snaps.iter().next_back())
            .map(|(boundary, state)| CheckpointSnapshot {
                stage: stage.clone(),
                boundary: *boundary,
                state: state.clone(),
            }))
    }

    fn gc(&mut self, stage: &StepId, before: RecoveryBoundary) -> StageResult<usize> {
        let Some(snaps) = self.db.get_mut(stage) else {
            return Ok(0);
        };
        // `split_off` returns the high end, so swap to keep it.
        let keep = snaps.split_off(&before);
        let garbage = std::mem::replace(snaps, keep);
        Ok(garbage.len())
    }
}

#[test]
fn latest_and_gc() {
    let stage = StepId::from("agg");
    let mut store = InMemCheckpointStore::new();
    for boundary in 1..=4 {
        store
            .write(&CheckpointSnapshot {
                stage: stage.clone(),
                boundary: RecoveryBoundary(boundary),
                state: StateBytes(vec![boundary as u8]),
            })
            .unwrap();
    }

    let latest = store.latest(&stage).unwrap().unwrap();
    assert_eq!(latest.boundary, RecoveryBoundary(4));
    assert_eq!(latest.state, StateBytes(vec![4]));

    assert_eq!(store.gc(&stage, RecoveryBoundary(3)).unwrap(), 2);
    assert_eq!(store.load(&stage, RecoveryBoundary(2)).unwrap(), None);
    assert!(store.load(&stage, RecoveryBoundary(3)).unwrap().is_some());
    assert_eq!(store.latest(&StepId::from("other")).unwrap(), None);
}
