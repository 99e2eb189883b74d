//! Fault tolerance for functional stages.
//!
//! A host runtime marks recovery boundaries. At each one it either
//! asks a stage for a [`CheckpointSnapshot`] or hands one back to
//! reset the stage. The [`CheckpointCoordinator`] drives that
//! exchange against a [`store::CheckpointStore`].
//!
//! Snapshots are opaque to the host: they are [`StateBytes`] encoded
//! with JSON so that they survive a process restart.

use std::fmt::Display;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::StageError;
use crate::errors::StageResult;

pub mod coordinator;
pub mod store;

pub use coordinator::CheckpointCoordinator;

/// Unique ID for a stage in the graph.
///
/// Snapshots are keyed off of this so state is never mixed between
/// stages.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl Display for StepId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifies the recovery boundary a snapshot was taken at.
///
/// Boundaries increase monotonically over the life of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecoveryBoundary(pub u64);

impl Display for RecoveryBoundary {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(fmt, "boundary {}", self.0)
    }
}

/// A serialized snapshot of some state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBytes(pub Vec<u8>);

impl StateBytes {
    /// Serialize a state object into bytes the recovery system can
    /// store.
    pub fn ser<T: Serialize>(obj: &T) -> StageResult<Self> {
        serde_json::to_vec(obj).map(Self).map_err(|err| {
            StageError::recovery(format!(
                "error serializing recovery state type {}: {err}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Deserialize these bytes back into a state object.
    pub fn de<T: DeserializeOwned>(&self) -> StageResult<T> {
        serde_json::from_slice(&self.0).map_err(|err| {
            StageError::recovery(format!(
                "error deserializing recovery state type {}: {err}",
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// The state of one stage at one recovery boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSnapshot {
    pub stage: StepId,
    pub boundary: RecoveryBoundary,
    pub state: StateBytes,
}

#[test]
fn state_bytes_round_trip() {
    let bytes = StateBytes::ser(&vec![("a".to_string(), 1_u64)]).unwrap();
    let state: Vec<(String, u64)> = bytes.de().unwrap();
    assert_eq!(state, vec![("a".to_string(), 1)]);
}

#[test]
fn corrupt_state_bytes_is_recovery_error() {
    let bytes = StateBytes(b"{not json".to_vec());
    let err = bytes.de::<u64>().unwrap_err();
    assert!(matches!(err, StageError::Recovery(_)));
}
