//! Durable storage for checkpoint snapshots.

use super::CheckpointSnapshot;
use super::RecoveryBoundary;
use super::StepId;
use crate::errors::StageResult;

pub mod in_mem;
pub mod sqlite;

pub use in_mem::InMemCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// All snapshot stores have to implement this.
///
/// Writing a snapshot for a boundary that already has one replaces
/// it, so a host re-running a checkpoint is harmless.
pub trait CheckpointStore: Send {
    fn write(&mut self, snapshot: &CheckpointSnapshot) -> StageResult<()>;

    fn load(
        &mut self,
        stage: &StepId,
        boundary: RecoveryBoundary,
    ) -> StageResult<Option<CheckpointSnapshot>>;

    /// The most recent snapshot of a stage.
    fn latest(&mut self, stage: &StepId) -> StageResult<Option<CheckpointSnapshot>>;

    /// Delete snapshots older than `before`, returning how many were
    /// removed.
    fn gc(&mut self, stage: &StepId, before: RecoveryBoundary) -> StageResult<usize>;
}

impl<S> CheckpointStore for Box<S>
where
    S: CheckpointStore + ?Sized,
{
    fn write(&mut self, snapshot: &CheckpointSnapshot) -> StageResult<()> {
        (**self).write(snapshot)
    }

    fn load(
        &mut self,
        stage: &StepId,
        boundary: RecoveryBoundary,
    ) -> StageResult<Option<CheckpointSnapshot>> {
        (**self).load(stage, boundary)
    }

    fn latest(&mut self, stage: &StepId) -> StageResult<Option<CheckpointSnapshot>> {
        (**self).latest(stage)
    }

    fn gc(&mut self, stage: &StepId, before: RecoveryBoundary) -> StageResult<usize> {
        (**self).gc(stage, before)
    }
}
