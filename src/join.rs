//! Join engine.
//!
//! A join stage buffers one input in a [`Window`] and joins every
//! element of a second, probe input against it. There are two ways
//! to pick the window contents a probe sees:
//!
//! - [`JoinStrategy::WholeWindow`]: the contents of every partition,
//!   merged in insertion order.
//! - [`JoinStrategy::Partitioned`]: only the partition whose key
//!   equals the probe's key. The probe key comes from its own key
//!   function, so the two inputs can have different types as long as
//!   their keys compare equal. A probe with no matching partition
//!   sees an empty window; the joiner is still called.
//!
//! Either way the joiner is called once per probe with the full
//! ordered list. The caller serializes this with window insertions.

use std::hash::Hash;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::errors::logic_err;
use crate::errors::panic_err;
use crate::errors::LogicResult;
use crate::errors::StageError;
use crate::errors::StageResult;
use crate::window::Window;

/// Computes the join key of a probe element.
pub type ProbeKeyFn<U, K> = Arc<dyn Fn(&U) -> LogicResult<K> + Send + Sync>;

pub enum JoinStrategy<U, K> {
    WholeWindow,
    Partitioned(ProbeKeyFn<U, K>),
}

impl<U, K> JoinStrategy<U, K> {
    pub fn partitioned<F>(probe_key: F) -> Self
    where
        F: Fn(&U) -> LogicResult<K> + Send + Sync + 'static,
    {
        Self::Partitioned(Arc::new(probe_key))
    }

    pub fn is_partitioned(&self) -> bool {
        matches!(self, Self::Partitioned(_))
    }
}

pub struct JoinEngine<U, K> {
    strategy: JoinStrategy<U, K>,
}

impl<U, K> JoinEngine<U, K>
where
    K: Clone + Hash + Eq,
{
    pub fn new(strategy: JoinStrategy<U, K>) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &JoinStrategy<U, K> {
        &self.strategy
    }

    /// Check the strategy fits the buffered window.
    pub fn validate<T>(&self, window: &Window<T, K>) -> StageResult<()>
    where
        T: Clone,
    {
        if self.strategy.is_partitioned() && !window.partitioner().is_keyed() {
            return Err(StageError::config(
                "partitioned join is missing the key function of its window",
            ));
        }
        Ok(())
    }

    /// The window contents `probe` joins against, oldest first.
    pub fn window_for<T>(&self, window: &mut Window<T, K>, probe: &U) -> StageResult<Vec<T>>
    where
        T: Clone,
    {
        match &self.strategy {
            JoinStrategy::WholeWindow => Ok(window.evaluate_all()),
            JoinStrategy::Partitioned(probe_key) => {
                let key = match catch_unwind(AssertUnwindSafe(|| probe_key(probe))) {
                    Ok(Ok(key)) => key,
                    Ok(Err(err)) => return Err(logic_err("join key function failed", err)),
                    Err(payload) => return Err(panic_err("join key function", payload)),
                };
                Ok(window.evaluate(&key))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvictionPolicy;
    use crate::window::Partitioner;
    use crate::window::SystemClock;

    type Buffered = (String, char);

    fn keyed_window() -> Window<Buffered, String> {
        Window::new(
            EvictionPolicy::Count(10),
            Partitioner::keyed(|(key, _): &Buffered| Ok(key.clone())),
            Box::new(SystemClock),
        )
        .unwrap()
    }

    #[test]
    fn partitioned_join_sees_matching_partition_only() {
        let mut window = keyed_window();
        window.insert(("k1".to_string(), 'a')).unwrap();
        window.insert(("k2".to_string(), 'b')).unwrap();

        // Probes are a different type than buffered elements.
        let engine =
            JoinEngine::new(JoinStrategy::partitioned(|probe: &u32| Ok(format!("k{probe}"))));
        engine.validate(&window).unwrap();

        let matched = engine.window_for(&mut window, &1).unwrap();
        assert_eq!(matched, vec![("k1".to_string(), 'a')]);

        let unmatched = engine.window_for(&mut window, &3).unwrap();
        assert!(unmatched.is_empty());
        // Probing must not create partitions.
        assert_eq!(window.partition_count(), 2);
    }

    #[test]
    fn whole_window_join_sees_everything_in_order() {
        let mut window = keyed_window();
        for (key, value) in [("k2", 'a'), ("k1", 'b'), ("k2", 'c')] {
            window.insert((key.to_string(), value)).unwrap();
        }
        let engine = JoinEngine::<char, String>::new(JoinStrategy::WholeWindow);
        let all: Vec<char> = engine
            .window_for(&mut window, &'x')
            .unwrap()
            .into_iter()
            .map(|(_, value)| value)
            .collect();
        assert_eq!(all, vec!['a', 'b', 'c']);
    }

    #[test]
    fn partitioned_join_needs_keyed_window() {
        let window = Window::<u64, u64>::new(
            EvictionPolicy::Count(3),
            Partitioner::Constant(0),
            Box::new(SystemClock),
        )
        .unwrap();
        let engine = JoinEngine::new(JoinStrategy::partitioned(|probe: &u64| Ok(*probe)));
        assert!(matches!(engine.validate(&window), Err(StageError::Config(_))));
    }
}
