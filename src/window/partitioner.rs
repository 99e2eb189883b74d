//! Assigning elements to window partitions.

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::errors::logic_err;
use crate::errors::panic_err;
use crate::errors::LogicResult;
use crate::errors::StageResult;

/// A key extraction function.
///
/// Must be pure: it can be called more than once for the same
/// element, e.g. again when a window is restored from a snapshot.
pub type KeyFn<T, K> = Arc<dyn Fn(&T) -> LogicResult<K> + Send + Sync>;

pub enum Partitioner<T, K> {
    /// Every element lands in the single partition with this key.
    Constant(K),
    Keyed(KeyFn<T, K>),
}

impl<T> Partitioner<T, ()> {
    pub fn unkeyed() -> Self {
        Self::Constant(())
    }
}

impl<T, K> Partitioner<T, K>
where
    K: Clone,
{
    pub fn keyed<F>(key_fn: F) -> Self
    where
        F: Fn(&T) -> LogicResult<K> + Send + Sync + 'static,
    {
        Self::Keyed(Arc::new(key_fn))
    }

    pub fn is_keyed(&self) -> bool {
        matches!(self, Self::Keyed(_))
    }

    /// Find the partition key of a value.
    ///
    /// Failures are logic errors and terminate the stage.
    pub fn key_for(&self, value: &T) -> StageResult<K> {
        match self {
            Self::Constant(key) => Ok(key.clone()),
            Self::Keyed(key_fn) => match catch_unwind(AssertUnwindSafe(|| key_fn(value))) {
                Ok(Ok(key)) => Ok(key),
                Ok(Err(err)) => Err(logic_err("key function failed", err)),
                Err(payload) => Err(panic_err("key function", payload)),
            },
        }
    }
}

impl<T, K> Clone for Partitioner<T, K>
where
    K: Clone,
{
    fn clone(&self) -> Self {
        match self {
            Self::Constant(key) => Self::Constant(key.clone()),
            Self::Keyed(key_fn) => Self::Keyed(key_fn.clone()),
        }
    }
}

#[test]
fn key_fn_errors_are_logic_errors() {
    let partitioner = Partitioner::keyed(|value: &i64| {
        if *value < 0 {
            Err("negative key".into())
        } else {
            Ok(value % 2)
        }
    });
    assert_eq!(partitioner.key_for(&3).unwrap(), 1);
    assert!(matches!(
        partitioner.key_for(&-1),
        Err(crate::errors::StageError::Logic(_))
    ));
}

#[test]
fn constant_bypasses_extraction() {
    let partitioner = Partitioner::<String, ()>::unkeyed();
    assert!(!partitioner.is_keyed());
    partitioner.key_for(&"anything".to_string()).unwrap();
}
