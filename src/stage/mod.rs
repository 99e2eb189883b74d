//! Stages and the callbacks a host runtime drives them with.
//!
//! A [`FunctionStage`] runs one piece of user logic in one of four
//! shapes (pipe, aggregate window, join, source). The host talks to
//! it through the [`Operator`] callbacks, usually via a [`Stage`],
//! which puts a [`DecouplingQueue`] in front of the operator when the
//! parameters ask for one.
//!
//! ```text
//! host input thread --process--> Stage --enqueue--> queue worker
//!                                   |                    |
//!                                   +--(no queue)--------+--> FunctionStage --submit--> Downstream
//! ```

use std::sync::Arc;

use prometheus::default_registry;
use prometheus::Registry;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ConfigContext;
use crate::config::StageParams;
use crate::errors::StageResult;
use crate::mapping::JsonMapping;
use crate::mapping::Mapping;
use crate::mapping::Tuple;
use crate::queue::Consumer;
use crate::queue::DecouplingQueue;
use crate::queue::Delivery;
use crate::recovery::CheckpointSnapshot;
use crate::recovery::RecoveryBoundary;
use crate::recovery::StepId;
use crate::window::Clock;
use crate::window::SystemClock;

mod function;

pub use function::FunctionStage;

/// Where a stage sends its output.
pub trait Downstream: Send + Sync {
    fn submit(&self, port: usize, tuple: Tuple) -> StageResult<()>;

    fn propagate_end_of_stream(&self, port: usize) -> StageResult<()>;
}

/// Mappings of a stage's ports and where its output goes.
pub struct StageIo<T, R, U = ()> {
    /// Main input, or the buffered side of a join.
    pub input: Arc<dyn Mapping<T>>,
    /// Probe side of a join.
    pub probe: Option<Arc<dyn Mapping<U>>>,
    pub output: Arc<dyn Mapping<R>>,
    pub downstream: Arc<dyn Downstream>,
}

impl<T, R, U> StageIo<T, R, U>
where
    T: Serialize + DeserializeOwned + 'static,
    R: Serialize + DeserializeOwned + 'static,
    U: Serialize + DeserializeOwned + 'static,
{
    /// Map every port through JSON.
    pub fn json(downstream: Arc<dyn Downstream>) -> Self {
        Self {
            input: Arc::new(JsonMapping::new()),
            probe: Some(Arc::new(JsonMapping::new())),
            output: Arc::new(JsonMapping::new()),
            downstream,
        }
    }
}

/// Process-wide things a stage is built with.
pub struct StageEnv {
    pub config: Arc<ConfigContext>,
    /// Where stage gauges are registered.
    pub registry: Registry,
    /// Time source of windows.
    pub clock: Box<dyn Clock>,
}

impl StageEnv {
    pub fn new(config: Arc<ConfigContext>) -> Self {
        Self {
            config,
            registry: default_registry().clone(),
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }
}

impl Default for StageEnv {
    fn default() -> Self {
        Self::new(Arc::new(ConfigContext::default()))
    }
}

/// Lifecycle callbacks of a stage as the host runtime sees it.
///
/// Every callback after a fatal error returns
/// [`crate::errors::StageError::Failed`].
pub trait Operator: Send + Sync + 'static {
    fn name(&self) -> &StepId;

    fn input_count(&self) -> usize;

    /// Process one tuple arriving on an input port.
    fn process(&self, port: usize, tuple: Tuple) -> StageResult<()>;

    /// An input port will not receive anything else.
    fn process_end_of_stream(&self, port: usize) -> StageResult<()>;

    /// Every input is connected. Starts producing on stages without
    /// inputs.
    fn all_inputs_ready(&self) -> StageResult<()>;

    fn shutdown(&self);

    fn reset_to_initial_state(&self) -> StageResult<()>;

    fn checkpoint(&self, boundary: RecoveryBoundary) -> StageResult<CheckpointSnapshot>;

    fn reset(&self, snapshot: &CheckpointSnapshot) -> StageResult<()>;
}

/// An operator with an optional decoupling queue in front.
pub struct Stage {
    operator: Arc<dyn Operator>,
    queue: Option<DecouplingQueue>,
}

impl Stage {
    pub fn new(operator: Arc<dyn Operator>, params: &StageParams) -> StageResult<Self> {
        let queue = match params.queue_capacity() {
            Some(capacity) => {
                let target = operator.clone();
                let consumer: Consumer = Box::new(move |delivery| match delivery {
                    Delivery::Element { port, tuple } => target.process(port, tuple),
                    Delivery::EndOfStream { port } => target.process_end_of_stream(port),
                });
                Some(DecouplingQueue::new(&params.name, capacity, consumer)?)
            }
            None => None,
        };
        Ok(Self { operator, queue })
    }

    pub fn operator(&self) -> &Arc<dyn Operator> {
        &self.operator
    }

    pub fn is_queued(&self) -> bool {
        self.queue.is_some()
    }

    /// Blocks while the queue is full.
    pub fn process(&self, port: usize, tuple: Tuple) -> StageResult<()> {
        match &self.queue {
            Some(queue) => queue.enqueue(port, tuple),
            None => self.operator.process(port, tuple),
        }
    }

    /// Queued tuples of `port` are processed before the marker.
    pub fn process_end_of_stream(&self, port: usize) -> StageResult<()> {
        match &self.queue {
            Some(queue) => queue.end_of_stream(port),
            None => self.operator.process_end_of_stream(port),
        }
    }

    pub fn all_inputs_ready(&self) -> StageResult<()> {
        self.operator.all_inputs_ready()
    }

    /// Queued tuples that were not processed yet are dropped.
    pub fn shutdown(&self) {
        if let Some(queue) = &self.queue {
            queue.shutdown();
        }
        self.operator.shutdown();
    }

    pub fn reset_to_initial_state(&self) -> StageResult<()> {
        if let Some(queue) = &self.queue {
            queue.discard()?;
        }
        self.operator.reset_to_initial_state()
    }

    /// Everything queued before the boundary is processed first.
    pub fn checkpoint(&self, boundary: RecoveryBoundary) -> StageResult<CheckpointSnapshot> {
        if let Some(queue) = &self.queue {
            queue.barrier()?;
        }
        self.operator.checkpoint(boundary)
    }

    /// Tuples queued before the reset belong to the abandoned state
    /// and are dropped.
    pub fn reset(&self, snapshot: &CheckpointSnapshot) -> StageResult<()> {
        if let Some(queue) = &self.queue {
            queue.discard()?;
        }
        self.operator.reset(snapshot)
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        if let Some(queue) = &self.queue {
            queue.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::CheckpointMode;
    use crate::config::PolicyParams;
    use crate::errors::StageError;
    use crate::logic::Function;
    use crate::logic::LogicSpec;
    use crate::testing::CaptureDownstream;
    use crate::testing::Emitted;
    use crate::window::Partitioner;

    fn env() -> StageEnv {
        StageEnv::default().with_registry(Registry::new())
    }

    #[test]
    fn queued_stage_keeps_order_and_marker_last() {
        let mut params = StageParams::new("queued-map");
        params.queue_size = Some(4);
        let capture = CaptureDownstream::new();
        let operator = FunctionStage::pipe(
            params.clone(),
            LogicSpec::stateless(|| Function::<u64, u64>::map(|v| Ok(v + 100))),
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        let stage = Stage::new(operator, &params).unwrap();
        assert!(stage.is_queued());

        for i in 0..50_u64 {
            stage.process(0, json!(i)).unwrap();
        }
        stage.process_end_of_stream(0).unwrap();
        assert!(capture.wait_for(51, Duration::from_secs(5)));

        let expected: Vec<_> = (100..150_u64).map(|v| json!(v)).collect();
        assert_eq!(capture.tuples(0), expected);
        assert_eq!(
            capture.emitted().last(),
            Some(&Emitted::EndOfStream { port: 0 })
        );
        stage.shutdown();
    }

    #[test]
    fn threaded_input_is_never_queued() {
        let mut params = StageParams::new("threaded-map");
        params.queue_size = Some(4);
        params.input_threaded = true;
        let operator = FunctionStage::pipe(
            params.clone(),
            LogicSpec::stateless(|| Function::<u64, u64>::map(Ok)),
            StageIo::json(CaptureDownstream::new()),
            env(),
        )
        .unwrap();
        let stage = Stage::new(operator, &params).unwrap();
        assert!(!stage.is_queued());
    }

    #[test]
    fn checkpoint_waits_for_queued_tuples() {
        let mut params = StageParams::new("queued-agg");
        params.queue_size = Some(8);
        params.checkpoint = CheckpointMode::Periodic;
        params.window = Some(PolicyParams::Count { size: 10 });
        let capture = CaptureDownstream::new();
        let operator = FunctionStage::aggregate(
            params.clone(),
            LogicSpec::stateless(|| {
                Function::<u64, u64>::aggregate(|window| Ok(Some(window.iter().sum())))
            }),
            Partitioner::unkeyed(),
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        let stage = Stage::new(operator, &params).unwrap();

        for i in 1..=4_u64 {
            stage.process(0, json!(i)).unwrap();
        }
        let snapshot = stage.checkpoint(RecoveryBoundary(1)).unwrap();
        // The barrier made every queued tuple land in the window.
        assert_eq!(capture.tuples(0).len(), 4);

        stage.process(0, json!(100)).unwrap();
        stage.reset(&snapshot).unwrap();
        stage.process(0, json!(5)).unwrap();
        stage.checkpoint(RecoveryBoundary(2)).unwrap();
        assert_eq!(capture.tuples(0).last(), Some(&json!(15)));
        stage.shutdown();
    }

    #[test]
    fn failure_behind_queue_surfaces_on_later_calls() {
        let mut params = StageParams::new("queued-failure");
        params.queue_size = Some(2);
        let operator = FunctionStage::pipe(
            params.clone(),
            LogicSpec::stateless(|| {
                Function::<u64, u64>::map(|v| if v == 3 { Err("three".into()) } else { Ok(v) })
            }),
            StageIo::json(CaptureDownstream::new()),
            env(),
        )
        .unwrap();
        let stage = Stage::new(operator.clone(), &params).unwrap();
        for i in 0..4_u64 {
            // Failures may surface on any enqueue after the third.
            if stage.process(0, json!(i)).is_err() {
                break;
            }
        }
        let mut res = Ok(());
        for _ in 0..100 {
            res = stage.process(0, json!(0));
            if res.is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(res, Err(StageError::Failed(_))));
        assert!(matches!(
            operator.process(0, json!(1)),
            Err(StageError::Failed(_))
        ));
    }
}
