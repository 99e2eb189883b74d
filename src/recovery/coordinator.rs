//! Moving stage snapshots in and out of a store.

use std::sync::Arc;

use super::store::CheckpointStore;
use super::RecoveryBoundary;
use super::StepId;
use crate::errors::StageError;
use crate::errors::StageResult;
use crate::stage::Stage;

/// Checkpoints and resets one stage at the recovery boundaries the
/// host runtime marks.
pub struct CheckpointCoordinator<S = Box<dyn CheckpointStore>> {
    stage: Arc<Stage>,
    store: S,
}

impl<S> CheckpointCoordinator<S>
where
    S: CheckpointStore,
{
    pub fn new(stage: Arc<Stage>, store: S) -> Self {
        Self { stage, store }
    }

    pub fn stage(&self) -> &Arc<Stage> {
        &self.stage
    }

    fn stage_id(&self) -> &StepId {
        self.stage.operator().name()
    }

    /// Snapshot the stage and persist it under `boundary`.
    pub fn checkpoint(&mut self, boundary: RecoveryBoundary) -> StageResult<()> {
        let snapshot = self.stage.checkpoint(boundary)?;
        self.store.write(&snapshot)?;
        tracing::info!("Checkpointed stage {} at {boundary}", snapshot.stage);
        Ok(())
    }

    /// Reset the stage to the snapshot taken at `boundary`.
    pub fn restore(&mut self, boundary: RecoveryBoundary) -> StageResult<()> {
        let stage = self.stage_id().clone();
        let snapshot = self.store.load(&stage, boundary)?.ok_or_else(|| {
            StageError::recovery(format!("no snapshot of stage {stage} at {boundary}"))
        })?;
        self.stage.reset(&snapshot)?;
        tracing::info!("Restored stage {stage} to {boundary}");
        Ok(())
    }

    /// Reset the stage to its most recent snapshot, or to its initial
    /// state if it has none. Returns the boundary restored.
    pub fn restore_latest(&mut self) -> StageResult<Option<RecoveryBoundary>> {
        let stage = self.stage_id().clone();
        match self.store.latest(&stage)? {
            Some(snapshot) => {
                self.stage.reset(&snapshot)?;
                tracing::info!("Restored stage {stage} to {}", snapshot.boundary);
                Ok(Some(snapshot.boundary))
            }
            None => {
                tracing::info!("No snapshot of stage {stage}; resetting to initial state");
                self.stage.reset_to_initial_state()?;
                Ok(None)
            }
        }
    }

    pub fn reset_to_initial_state(&mut self) -> StageResult<()> {
        self.stage.reset_to_initial_state()
    }

    /// Drop snapshots older than `before`.
    pub fn gc(&mut self, before: RecoveryBoundary) -> StageResult<usize> {
        let stage = self.stage_id().clone();
        let removed = self.store.gc(&stage, before)?;
        tracing::debug!("Removed {removed} snapshots of stage {stage} before {before}");
        Ok(removed)
    }
}
