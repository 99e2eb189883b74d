//! Conversion between wire records and typed values.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::StageError;
use crate::errors::StageResult;

/// A record as it arrives on a stage input or leaves on an output.
pub type Tuple = serde_json::Value;

/// Converts wire records to and from the values user logic sees.
pub trait Mapping<V>: Send + Sync {
    fn from_tuple(&self, tuple: Tuple) -> StageResult<V>;

    fn to_tuple(&self, value: &V) -> StageResult<Tuple>;
}

/// Maps any serde type through its JSON representation.
pub struct JsonMapping<V>(PhantomData<fn() -> V>);

impl<V> JsonMapping<V> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<V> Default for JsonMapping<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Mapping<V> for JsonMapping<V>
where
    V: Serialize + DeserializeOwned,
{
    fn from_tuple(&self, tuple: Tuple) -> StageResult<V> {
        serde_json::from_value(tuple).map_err(|err| {
            StageError::logic(format!(
                "unable to map tuple to {}: {err}",
                std::any::type_name::<V>()
            ))
        })
    }

    fn to_tuple(&self, value: &V) -> StageResult<Tuple> {
        serde_json::to_value(value).map_err(|err| {
            StageError::logic(format!(
                "unable to map {} to tuple: {err}",
                std::any::type_name::<V>()
            ))
        })
    }
}

#[test]
fn bad_tuple_is_logic_error() {
    let mapping = JsonMapping::<(String, u64)>::new();
    let value = mapping.from_tuple(serde_json::json!(["a", 1])).unwrap();
    assert_eq!(value, ("a".to_string(), 1));

    let err = mapping.from_tuple(serde_json::json!({"a": 1})).unwrap_err();
    assert!(matches!(err, StageError::Logic(_)));
}
