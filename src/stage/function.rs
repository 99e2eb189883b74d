//! A stage that runs one [`crate::logic::Function`] over its inputs.
//!
//! The shape of the stage decides how tuples reach the logic:
//!
//! - Pipe: every tuple of input 0 is one map, flat-map, filter or
//!   sink invocation.
//! - Aggregate: tuples of input 0 go into a [`Window`]; the trigger
//!   policy decides when the aggregation runs over a partition.
//! - Join: tuples of input 0 go into a [`Window`], tuples of input 1
//!   are probes joined against it by the [`JoinEngine`].
//! - Source: no inputs; a producer thread pulls from the logic once
//!   all inputs are ready.
//!
//! The window lock, then the logic slot lock, serialize everything
//! that touches stage state. Results are routed downstream while
//! both are held.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::Operator;
use super::StageEnv;
use super::StageIo;
use crate::common::lock;
use crate::config::EvictionPolicy;
use crate::config::StageParams;
use crate::config::TriggerPolicy;
use crate::errors::prepend_tname;
use crate::errors::StageError;
use crate::errors::StageResult;
use crate::join::JoinEngine;
use crate::join::JoinStrategy;
use crate::logic::Call;
use crate::logic::Emit;
use crate::logic::FunctionContext;
use crate::logic::FunctionKind;
use crate::logic::LogicHandler;
use crate::logic::LogicSpec;
use crate::mapping::Tuple;
use crate::metrics::MetricsReporter;
use crate::metrics::PARTITION_COUNT_GAUGE;
use crate::recovery::CheckpointSnapshot;
use crate::recovery::RecoveryBoundary;
use crate::recovery::StateBytes;
use crate::recovery::StepId;
use crate::timer::PeriodicTask;
use crate::timer::Timer;
use crate::window::Clock;
use crate::window::Partitioner;
use crate::window::SavedElement;
use crate::window::Window;

/// Longest delay between two time eviction sweeps.
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(1);

enum Shape<T, U, K> {
    Pipe,
    Source,
    Aggregate {
        window: Mutex<Window<T, K>>,
        trigger: TriggerPolicy,
    },
    Join {
        window: Mutex<Window<T, K>>,
        engine: JoinEngine<U, K>,
    },
}

impl<T, U, K> Shape<T, U, K> {
    fn name(&self) -> &'static str {
        match self {
            Self::Pipe => "pipe",
            Self::Source => "source",
            Self::Aggregate { .. } => "aggregate",
            Self::Join { .. } => "join",
        }
    }

    fn input_count(&self) -> usize {
        match self {
            Self::Source => 0,
            Self::Pipe | Self::Aggregate { .. } => 1,
            Self::Join { .. } => 2,
        }
    }

    fn accepts(&self, kind: FunctionKind) -> bool {
        match self {
            Self::Pipe => matches!(
                kind,
                FunctionKind::Map | FunctionKind::FlatMap | FunctionKind::Sink
            ),
            Self::Source => kind == FunctionKind::Source,
            Self::Aggregate { .. } => kind == FunctionKind::Aggregate,
            Self::Join { .. } => kind == FunctionKind::Join,
        }
    }
}

enum ShapeParams<T, U, K> {
    Pipe,
    Source,
    Aggregate(Partitioner<T, K>),
    Join(Partitioner<T, K>, JoinStrategy<U, K>),
}

#[derive(Copy, Clone)]
enum TimerEvent {
    /// Evict aged elements.
    Sweep,
    /// Periodic trigger.
    Fire,
}

/// What a stage snapshot holds.
#[derive(Serialize, Deserialize)]
struct StageState {
    /// Only stateful logic is snapshotted.
    logic: Option<StateBytes>,
    window: Option<Vec<SavedElement>>,
}

pub struct FunctionStage<T, R, U = (), K = ()> {
    me: Weak<Self>,
    name: StepId,
    handler: Arc<LogicHandler<T, R, U>>,
    io: StageIo<T, R, U>,
    shape: Shape<T, U, K>,
    /// Input ports that saw their final marker.
    finals: Mutex<BTreeSet<usize>>,
    failure: Mutex<Option<String>>,
    shut_down: AtomicBool,
    finished: AtomicBool,
    metrics: Arc<MetricsReporter>,
    timer: Arc<Timer>,
    tasks: Mutex<Vec<PeriodicTask>>,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl<T, R> FunctionStage<T, R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    /// A stage running map, flat-map, filter or sink logic.
    pub fn pipe(
        params: StageParams,
        spec: LogicSpec<T, R>,
        io: StageIo<T, R>,
        env: StageEnv,
    ) -> StageResult<Arc<Self>> {
        Self::build(params, spec, io, env, ShapeParams::Pipe)
    }

    /// A stage without inputs running source logic.
    pub fn source(
        params: StageParams,
        spec: LogicSpec<T, R>,
        io: StageIo<T, R>,
        env: StageEnv,
    ) -> StageResult<Arc<Self>> {
        Self::build(params, spec, io, env, ShapeParams::Source)
    }
}

impl<T, R, K> FunctionStage<T, R, (), K>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    K: Clone + Hash + Eq + Send + 'static,
{
    pub fn aggregate(
        params: StageParams,
        spec: LogicSpec<T, R>,
        partitioner: Partitioner<T, K>,
        io: StageIo<T, R>,
        env: StageEnv,
    ) -> StageResult<Arc<Self>> {
        Self::build(params, spec, io, env, ShapeParams::Aggregate(partitioner))
    }
}

impl<T, R, U, K> FunctionStage<T, R, U, K>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    U: Send + 'static,
    K: Clone + Hash + Eq + Send + 'static,
{
    /// A stage buffering input 0 in a window and joining every tuple
    /// of input 1 against it.
    pub fn join(
        params: StageParams,
        spec: LogicSpec<T, R, U>,
        partitioner: Partitioner<T, K>,
        strategy: JoinStrategy<U, K>,
        io: StageIo<T, R, U>,
        env: StageEnv,
    ) -> StageResult<Arc<Self>> {
        Self::build(
            params,
            spec,
            io,
            env,
            ShapeParams::Join(partitioner, strategy),
        )
    }

    fn build(
        params: StageParams,
        spec: LogicSpec<T, R, U>,
        io: StageIo<T, R, U>,
        env: StageEnv,
        shape: ShapeParams<T, U, K>,
    ) -> StageResult<Arc<Self>> {
        params.validate()?;
        let name = StepId(params.name.clone());
        let StageEnv {
            config,
            registry,
            clock,
        } = env;

        let timer = Arc::new(Timer::new(&params.name)?);
        let metrics = Arc::new(MetricsReporter::new(
            name.clone(),
            registry,
            timer.clone(),
            params.metrics_refresh(),
        ));

        let shape = match shape {
            ShapeParams::Pipe | ShapeParams::Source if params.window.is_some() => {
                return Err(StageError::config(format!(
                    "stage {name} has a window but neither aggregates nor joins"
                )));
            }
            ShapeParams::Pipe => Shape::Pipe,
            ShapeParams::Source => Shape::Source,
            ShapeParams::Aggregate(partitioner) => {
                let window = build_window(&params, partitioner, clock, &metrics)?;
                Shape::Aggregate {
                    window: Mutex::new(window),
                    trigger: params.aggregate_trigger()?,
                }
            }
            ShapeParams::Join(partitioner, strategy) => {
                if params.trigger.is_some() {
                    return Err(StageError::config(format!(
                        "join stage {name} can't have a trigger policy"
                    )));
                }
                if io.probe.is_none() {
                    return Err(StageError::config(format!(
                        "join stage {name} has no probe mapping"
                    )));
                }
                let window = build_window(&params, partitioner, clock, &metrics)?;
                let engine = JoinEngine::new(strategy);
                engine.validate(&window)?;
                Shape::Join {
                    window: Mutex::new(window),
                    engine,
                }
            }
        };

        let context = FunctionContext::new(
            name.clone(),
            params.channel,
            params.max_channels,
            config,
            metrics.clone(),
        );
        let handler = LogicHandler::new(spec, &params, context)?;
        if !shape.accepts(handler.kind()) {
            handler.close();
            return Err(StageError::config(format!(
                "{} logic can't run in {} stage {name}",
                handler.kind(),
                shape.name()
            )));
        }

        let stage = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name,
            handler,
            io,
            shape,
            finals: Mutex::new(BTreeSet::new()),
            failure: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            metrics,
            timer,
            tasks: Mutex::new(Vec::new()),
            producer: Mutex::new(None),
        });
        stage.schedule(&params)?;
        tracing::info!(
            "Initialized {} stage {} with {} logic",
            stage.shape.name(),
            stage.name,
            stage.handler.kind()
        );
        Ok(stage)
    }

    pub fn handler(&self) -> &Arc<LogicHandler<T, R, U>> {
        &self.handler
    }

    pub fn metrics(&self) -> &Arc<MetricsReporter> {
        &self.metrics
    }

    /// Number of live window partitions, if the stage has a window.
    pub fn partition_count(&self) -> Option<usize> {
        match &self.shape {
            Shape::Aggregate { window, .. } | Shape::Join { window, .. } => {
                Some(lock(window).partition_count())
            }
            Shape::Pipe | Shape::Source => None,
        }
    }

    fn schedule(&self, params: &StageParams) -> StageResult<()> {
        let mut tasks = lock(&self.tasks);
        let eviction = params.window.as_ref().map(|w| w.eviction()).transpose()?;
        if let Some(EvictionPolicy::Time(age)) = eviction {
            let period = age.min(MAX_SWEEP_PERIOD);
            tasks.push(self.schedule_event(period, TimerEvent::Sweep));
        }
        if let Shape::Aggregate {
            trigger: TriggerPolicy::Periodic(period),
            ..
        } = &self.shape
        {
            tasks.push(self.schedule_event(*period, TimerEvent::Fire));
        }
        Ok(())
    }

    fn schedule_event(&self, period: Duration, event: TimerEvent) -> PeriodicTask {
        let me = self.me.clone();
        self.timer.schedule_with_fixed_delay(period, move || {
            if let Some(stage) = me.upgrade() {
                stage.on_timer(event);
            }
        })
    }

    fn on_timer(&self, event: TimerEvent) {
        if self.check().is_err() || self.finished.load(Ordering::SeqCst) {
            return;
        }
        let res = match event {
            TimerEvent::Sweep => self.sweep(),
            TimerEvent::Fire => self.fire_all(),
        };
        // Recorded; the host sees it on its next callback.
        let _ = self.record(res);
    }

    fn check(&self) -> StageResult<()> {
        if let Some(failure) = lock(&self.failure).as_ref() {
            return Err(StageError::Failed(format!(
                "stage {} failed: {failure}",
                self.name
            )));
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(StageError::Shutdown(format!("stage {}", self.name)));
        }
        Ok(())
    }

    /// Remember fatal errors so every later callback fails.
    fn record<X>(&self, res: StageResult<X>) -> StageResult<X> {
        if let Err(err) = &res {
            if err.is_fatal() {
                let mut failure = lock(&self.failure);
                if failure.is_none() {
                    tracing::error!(
                        "{}",
                        prepend_tname(format!("Stage {} failed: {err}", self.name))
                    );
                    *failure = Some(err.to_string());
                }
            }
        }
        res
    }

    fn route(&self, emit: Emit<R>) -> StageResult<()> {
        for value in emit.into_vec() {
            let tuple = self.io.output.to_tuple(&value)?;
            self.io.downstream.submit(0, tuple)?;
        }
        Ok(())
    }

    fn process_tuple(&self, port: usize, tuple: Tuple) -> StageResult<()> {
        match (&self.shape, port) {
            (Shape::Pipe, 0) => {
                let value = self.io.input.from_tuple(tuple)?;
                tracing::trace!("Stage {} processing element", self.name);
                self.handler
                    .invoke(Call::Element(value), |emit| self.route(emit))
            }
            (Shape::Aggregate { window, trigger }, 0) => {
                let value = self.io.input.from_tuple(tuple)?;
                let mut window = lock(window);
                let insertion = window.insert(value)?;
                let fires = match trigger {
                    TriggerPolicy::Count(every) => insertion.inserted % every == 0,
                    TriggerPolicy::Periodic(_) => false,
                };
                if fires {
                    self.fire(&mut *window, &insertion.key)?;
                }
                Ok(())
            }
            (Shape::Join { window, .. }, 0) => {
                let value = self.io.input.from_tuple(tuple)?;
                lock(window).insert(value)?;
                Ok(())
            }
            (Shape::Join { window, engine }, 1) => {
                let probe = match &self.io.probe {
                    Some(mapping) => mapping.from_tuple(tuple)?,
                    None => return Err(StageError::config("join stage has no probe mapping")),
                };
                let mut window = lock(window);
                let matched = engine.window_for(&mut *window, &probe)?;
                tracing::trace!(
                    "Stage {} joining probe against {} elements",
                    self.name,
                    matched.len()
                );
                self.handler
                    .invoke(Call::Probe(probe, &matched), |emit| self.route(emit))
            }
            (shape, port) => Err(StageError::config(format!(
                "{} stage {} has no input port {port}",
                shape.name(),
                self.name
            ))),
        }
    }

    /// Run the aggregation over one partition.
    fn fire(&self, window: &mut Window<T, K>, key: &K) -> StageResult<()> {
        let contents = window.evaluate(key);
        if contents.is_empty() {
            return Ok(());
        }
        self.handler
            .invoke(Call::Window(&contents), |emit| self.route(emit))
    }

    /// Run the aggregation over every partition, oldest first.
    fn fire_all(&self) -> StageResult<()> {
        if let Shape::Aggregate { window, .. } = &self.shape {
            let mut window = lock(window);
            // End of stream already flushed.
            if self.finished.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.fire_each(&mut *window)?;
        }
        Ok(())
    }

    fn fire_each(&self, window: &mut Window<T, K>) -> StageResult<()> {
        window.expire();
        for key in window.keys() {
            self.fire(window, &key)?;
        }
        Ok(())
    }

    fn sweep(&self) -> StageResult<()> {
        match &self.shape {
            Shape::Aggregate { window, trigger } => {
                let mut window = lock(window);
                if self.finished.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let modified = window.expire();
                if trigger.is_per_modification() {
                    for key in modified {
                        self.fire(&mut *window, &key)?;
                    }
                }
                Ok(())
            }
            Shape::Join { window, .. } => {
                lock(window).expire();
                Ok(())
            }
            Shape::Pipe | Shape::Source => Ok(()),
        }
    }

    /// Every input is final: flush, do the last metrics refresh and
    /// pass the marker on.
    fn finish(&self) -> StageResult<()> {
        // Timer events check `finished` while holding the window lock,
        // so none of them fires after the flush below.
        let first = self.with_window(|window| {
            if self.finished.swap(true, Ordering::SeqCst) {
                return Ok(false);
            }
            if let (
                Some(window),
                Shape::Aggregate {
                    trigger: TriggerPolicy::Periodic(_),
                    ..
                },
            ) = (window, &self.shape)
            {
                self.fire_each(window)?;
            }
            Ok(true)
        })?;
        if !first {
            return Ok(());
        }
        for task in lock(&self.tasks).drain(..) {
            task.cancel();
        }
        self.metrics.finalize();
        if let Shape::Source = self.shape {
            self.handler.close();
        }
        tracing::info!("All inputs of stage {} are final", self.name);
        if self.handler.kind() == FunctionKind::Sink {
            return Ok(());
        }
        self.io.downstream.propagate_end_of_stream(0)
    }

    fn with_window<X>(
        &self,
        f: impl FnOnce(Option<&mut Window<T, K>>) -> StageResult<X>,
    ) -> StageResult<X> {
        match &self.shape {
            Shape::Aggregate { window, .. } | Shape::Join { window, .. } => {
                let mut window = lock(window);
                f(Some(&mut *window))
            }
            Shape::Pipe | Shape::Source => f(None),
        }
    }

    fn produce(&self) {
        loop {
            if self.check().is_err() {
                return;
            }
            let res = self.handler.invoke(Call::Pull, |emit| match emit {
                Emit::Exhausted => Ok(false),
                emit => self.route(emit).map(|()| true),
            });
            match self.record(res) {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => return,
            }
        }
        tracing::debug!("Source of stage {} is exhausted", self.name);
        let _ = self.record(self.finish());
    }
}

fn build_window<T, K>(
    params: &StageParams,
    partitioner: Partitioner<T, K>,
    clock: Box<dyn Clock>,
    metrics: &MetricsReporter,
) -> StageResult<Window<T, K>>
where
    T: Clone,
    K: Clone + Hash + Eq,
{
    if params.keyed && !partitioner.is_keyed() {
        return Err(StageError::config(format!(
            "Missing key function for partitioned window of stage {}",
            params.name
        )));
    }
    let gauge = metrics.builtin_gauge(PARTITION_COUNT_GAUGE, "number of window partitions")?;
    Ok(Window::new(params.eviction()?, partitioner, clock)?.with_partition_gauge(gauge))
}

impl<T, R, U, K> Operator for FunctionStage<T, R, U, K>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    U: Send + 'static,
    K: Clone + Hash + Eq + Send + 'static,
{
    fn name(&self) -> &StepId {
        &self.name
    }

    fn input_count(&self) -> usize {
        self.shape.input_count()
    }

    fn process(&self, port: usize, tuple: Tuple) -> StageResult<()> {
        self.check()?;
        let res = self.process_tuple(port, tuple);
        self.record(res)
    }

    fn process_end_of_stream(&self, port: usize) -> StageResult<()> {
        self.check()?;
        let inputs = self.input_count();
        if port >= inputs {
            return Err(StageError::config(format!(
                "stage {} has no input port {port}",
                self.name
            )));
        }
        let all_final = {
            let mut finals = lock(&self.finals);
            if !finals.insert(port) {
                tracing::debug!("Duplicate final marker on port {port} of stage {}", self.name);
            }
            finals.len() == inputs
        };
        if all_final {
            self.record(self.finish())
        } else {
            Ok(())
        }
    }

    fn all_inputs_ready(&self) -> StageResult<()> {
        self.check()?;
        if self.input_count() > 0 {
            return Ok(());
        }
        let mut producer = lock(&self.producer);
        if producer.is_some() {
            return Ok(());
        }
        let me = self.me.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-source", self.name))
            .spawn(move || {
                if let Some(stage) = me.upgrade() {
                    stage.produce();
                }
            })?;
        *producer = Some(handle);
        tracing::info!("Started source of stage {}", self.name);
        Ok(())
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down stage {}", self.name);
        for task in lock(&self.tasks).drain(..) {
            task.cancel();
        }
        self.metrics.shutdown();
        let producer = lock(&self.producer).take();
        if let Some(producer) = producer {
            if producer.thread().id() != std::thread::current().id() && producer.join().is_err() {
                tracing::error!("Source of stage {} panicked", self.name);
            }
        }
        self.handler.close();
    }

    fn reset_to_initial_state(&self) -> StageResult<()> {
        self.check()?;
        self.with_window(|window| {
            if let Some(window) = window {
                window.clear();
            }
            self.handler.reset_to_initial_state()
        })
    }

    fn checkpoint(&self, boundary: RecoveryBoundary) -> StageResult<CheckpointSnapshot> {
        self.check()?;
        let state = self.with_window(|window| {
            let window = window
                .map(|window| window.snapshot(self.io.input.as_ref()))
                .transpose()
                .map_err(|err| {
                    StageError::recovery(format!(
                        "error checkpointing window of stage {}: {err}",
                        self.name
                    ))
                })?;
            let logic = self.handler.checkpoint()?;
            Ok(StageState { logic, window })
        })?;
        let state = StateBytes::ser(&state)?;
        tracing::debug!(
            "Checkpointed stage {} at {boundary} in {} bytes",
            self.name,
            state.len()
        );
        Ok(CheckpointSnapshot {
            stage: self.name.clone(),
            boundary,
            state,
        })
    }

    fn reset(&self, snapshot: &CheckpointSnapshot) -> StageResult<()> {
        self.check()?;
        if snapshot.stage != self.name {
            return Err(StageError::recovery(format!(
                "snapshot of stage {} can't reset stage {}",
                snapshot.stage, self.name
            )));
        }
        let saved: StageState = snapshot.state.de()?;
        self.with_window(|window| {
            if let Some(window) = window {
                window
                    .restore(saved.window.unwrap_or_default(), self.io.input.as_ref())
                    .map_err(|err| {
                        StageError::recovery(format!(
                            "error restoring window of stage {}: {err}",
                            self.name
                        ))
                    })?;
            }
            match &saved.logic {
                Some(state) => self.handler.reset(state),
                None if self.handler.is_stateful() => Err(StageError::recovery(format!(
                    "snapshot of stage {} has no logic state",
                    self.name
                ))),
                None => Ok(()),
            }
        })?;
        tracing::debug!("Reset stage {} to {}", self.name, snapshot.boundary);
        Ok(())
    }
}

impl<T, R, U, K> Drop for FunctionStage<T, R, U, K> {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use chrono::TimeZone;
    use chrono::Utc;
    use prometheus::Registry;
    use serde_json::json;

    use super::*;
    use crate::config::CheckpointMode;
    use crate::config::PolicyParams;
    use crate::config::TimeUnit;
    use crate::errors::LogicResult;
    use crate::logic::AggregateLogic;
    use crate::logic::Function;
    use crate::logic::HandlerState;
    use crate::logic::JoinLogic;
    use crate::logic::Logic;
    use crate::logic::MapLogic;
    use crate::logic::SourceLogic;
    use crate::testing::CaptureDownstream;
    use crate::testing::Emitted;
    use crate::window::TestingClock;

    fn env() -> StageEnv {
        StageEnv::default().with_registry(Registry::new())
    }

    fn windowed(name: &str, window: PolicyParams) -> StageParams {
        let mut params = StageParams::new(name);
        params.window = Some(window);
        params
    }

    fn sum() -> LogicSpec<u64, u64> {
        LogicSpec::stateless(|| {
            Function::aggregate(|window: &[u64]| Ok(Some(window.iter().sum())))
        })
    }

    fn values(capture: &CaptureDownstream) -> Vec<u64> {
        capture
            .tuples(0)
            .into_iter()
            .map(|tuple| serde_json::from_value(tuple).unwrap())
            .collect()
    }

    #[test]
    fn pipe_emits_in_order_then_marker() {
        let capture = CaptureDownstream::new();
        let stage = FunctionStage::pipe(
            StageParams::new("pipe"),
            LogicSpec::stateless(|| Function::<u64, u64>::flat_map(|v| Ok(vec![v; v as usize]))),
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        for v in [1, 0, 2] {
            stage.process(0, json!(v)).unwrap();
        }
        stage.process_end_of_stream(0).unwrap();
        assert_eq!(
            capture.emitted(),
            vec![
                Emitted::Tuple {
                    port: 0,
                    tuple: json!(1)
                },
                Emitted::Tuple {
                    port: 0,
                    tuple: json!(2)
                },
                Emitted::Tuple {
                    port: 0,
                    tuple: json!(2)
                },
                Emitted::EndOfStream { port: 0 },
            ]
        );
    }

    #[test]
    fn sink_does_not_propagate_marker() {
        let capture = CaptureDownstream::new();
        let seen = Arc::new(AtomicI64::new(0));
        let spec = {
            let seen = seen.clone();
            LogicSpec::stateless(move || {
                let seen = seen.clone();
                Function::<i64, ()>::sink(move |v| {
                    seen.fetch_add(v, Ordering::SeqCst);
                    Ok(())
                })
            })
        };
        let stage = FunctionStage::pipe(
            StageParams::new("sink"),
            spec,
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        stage.process(0, json!(4)).unwrap();
        stage.process(0, json!(5)).unwrap();
        stage.process_end_of_stream(0).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 9);
        assert!(capture.emitted().is_empty());
    }

    #[test]
    fn per_modification_aggregate() {
        let capture = CaptureDownstream::new();
        let stage = FunctionStage::aggregate(
            windowed("agg-last3", PolicyParams::Count { size: 3 }),
            sum(),
            Partitioner::unkeyed(),
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        for v in 1..=5 {
            stage.process(0, json!(v)).unwrap();
        }
        assert_eq!(values(&capture), vec![1, 3, 6, 9, 12]);
        assert_eq!(stage.partition_count(), Some(1));
        assert_eq!(stage.metrics().value(PARTITION_COUNT_GAUGE), Some(1));
    }

    #[test]
    fn count_trigger_fires_per_partition() {
        let capture = CaptureDownstream::new();
        let mut params = windowed("agg-count2", PolicyParams::Count { size: 10 });
        params.trigger = Some(PolicyParams::Count { size: 2 });
        params.keyed = true;
        let stage = FunctionStage::aggregate(
            params,
            sum(),
            Partitioner::keyed(|v: &u64| Ok(v % 2)),
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        for v in 1..=6 {
            stage.process(0, json!(v)).unwrap();
        }
        // Odd partition fires at 3, even partition at 4.
        assert_eq!(values(&capture), vec![4, 6]);
        assert_eq!(stage.partition_count(), Some(2));
    }

    #[test]
    fn periodic_trigger_flushes_at_end_of_stream() {
        let capture = CaptureDownstream::new();
        let mut params = windowed("agg-periodic", PolicyParams::Count { size: 5 });
        params.trigger = Some(PolicyParams::Time {
            size: 1,
            unit: TimeUnit::Hours,
        });
        let stage = FunctionStage::aggregate(
            params,
            sum(),
            Partitioner::unkeyed(),
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        for v in 1..=3 {
            stage.process(0, json!(v)).unwrap();
        }
        assert!(capture.emitted().is_empty());

        stage.process_end_of_stream(0).unwrap();
        assert_eq!(
            capture.emitted(),
            vec![
                Emitted::Tuple {
                    port: 0,
                    tuple: json!(6)
                },
                Emitted::EndOfStream { port: 0 },
            ]
        );
    }

    #[test]
    fn timer_events_after_end_of_stream_emit_nothing() {
        let capture = CaptureDownstream::new();
        let mut params = windowed("agg-late-timer", PolicyParams::Count { size: 5 });
        params.trigger = Some(PolicyParams::Time {
            size: 1,
            unit: TimeUnit::Hours,
        });
        let stage = FunctionStage::aggregate(
            params,
            sum(),
            Partitioner::unkeyed(),
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        stage.process(0, json!(1)).unwrap();
        stage.process(0, json!(2)).unwrap();
        stage.process_end_of_stream(0).unwrap();

        // A tick that was already past its first check when the
        // flush ran.
        stage.fire_all().unwrap();
        stage.sweep().unwrap();
        assert_eq!(
            capture.emitted(),
            vec![
                Emitted::Tuple {
                    port: 0,
                    tuple: json!(3)
                },
                Emitted::EndOfStream { port: 0 },
            ]
        );
    }

    #[test]
    fn count_trigger_phase_survives_checkpoint() {
        fn run(reset: bool) -> Vec<u64> {
            let capture = CaptureDownstream::new();
            let mut params = windowed("agg-count-phase", PolicyParams::Count { size: 2 });
            params.trigger = Some(PolicyParams::Count { size: 3 });
            let stage = FunctionStage::aggregate(
                params,
                sum(),
                Partitioner::unkeyed(),
                StageIo::json(capture.clone()),
                env(),
            )
            .unwrap();
            for v in 1..=4 {
                stage.process(0, json!(v)).unwrap();
            }
            if reset {
                let snapshot = stage.checkpoint(RecoveryBoundary(1)).unwrap();
                stage.reset(&snapshot).unwrap();
            }
            for v in 5..=6 {
                stage.process(0, json!(v)).unwrap();
            }
            values(&capture)
        }

        assert_eq!(run(false), vec![5, 11]);
        assert_eq!(run(true), vec![5, 11]);
    }

    #[test]
    fn time_eviction_fires_on_sweep() {
        let start = Utc.with_ymd_and_hms(2023, 3, 16, 9, 0, 0).unwrap();
        let clock = TestingClock::new(start);
        let capture = CaptureDownstream::new();
        let stage = FunctionStage::aggregate(
            windowed(
                "agg-time",
                PolicyParams::Time {
                    size: 1,
                    unit: TimeUnit::Hours,
                },
            ),
            sum(),
            Partitioner::unkeyed(),
            StageIo::json(capture.clone()),
            env().with_clock(clock.clone()),
        )
        .unwrap();

        stage.process(0, json!(1)).unwrap();
        clock.advance(chrono::Duration::minutes(30));
        stage.process(0, json!(2)).unwrap();
        clock.advance(chrono::Duration::minutes(45));
        stage.sweep().unwrap();
        assert_eq!(values(&capture), vec![1, 3, 2]);

        // Emptied partitions are dropped without firing.
        clock.advance(chrono::Duration::hours(2));
        stage.sweep().unwrap();
        assert_eq!(values(&capture), vec![1, 3, 2]);
        assert_eq!(stage.partition_count(), Some(0));
    }

    #[test]
    fn missing_key_function_is_config_error() {
        let mut params = windowed("agg-unkeyed", PolicyParams::Count { size: 3 });
        params.keyed = true;
        let res = FunctionStage::aggregate(
            params,
            sum(),
            Partitioner::unkeyed(),
            StageIo::json(CaptureDownstream::new()),
            env(),
        );
        assert!(matches!(res, Err(StageError::Config(_))));
    }

    #[test]
    fn logic_kind_must_fit_shape() {
        let res = FunctionStage::pipe(
            StageParams::new("pipe-agg"),
            sum(),
            StageIo::json(CaptureDownstream::new()),
            env(),
        );
        assert!(matches!(res, Err(StageError::Config(_))));
    }

    #[test]
    fn logic_error_is_fatal() {
        let capture = CaptureDownstream::new();
        let stage = FunctionStage::pipe(
            StageParams::new("pipe-fails"),
            LogicSpec::stateless(|| {
                Function::<u64, u64>::map(|v| if v == 2 { Err("two".into()) } else { Ok(v) })
            }),
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        stage.process(0, json!(1)).unwrap();
        assert!(matches!(
            stage.process(0, json!(2)),
            Err(StageError::Logic(_))
        ));
        assert!(matches!(
            stage.process(0, json!(3)),
            Err(StageError::Failed(_))
        ));
        assert!(matches!(
            stage.process_end_of_stream(0),
            Err(StageError::Failed(_))
        ));
        assert_eq!(values(&capture), vec![1]);
    }

    #[test]
    fn unmappable_tuple_is_fatal() {
        let stage = FunctionStage::pipe(
            StageParams::new("pipe-bad-tuple"),
            LogicSpec::stateless(|| Function::<u64, u64>::map(Ok)),
            StageIo::json(CaptureDownstream::new()),
            env(),
        )
        .unwrap();
        assert!(stage.process(0, json!("not a number")).is_err());
        assert!(matches!(
            stage.process(0, json!(1)),
            Err(StageError::Failed(_))
        ));
    }

    #[test]
    fn whole_window_join_sees_last_three() {
        let capture = CaptureDownstream::new();
        let stage = FunctionStage::join(
            windowed("join-whole", PolicyParams::Count { size: 3 }),
            LogicSpec::stateless(|| {
                Function::<u64, String, String>::join(|probe, window: &[u64]| {
                    Ok(Some(format!("{probe}{window:?}")))
                })
            }),
            Partitioner::unkeyed(),
            JoinStrategy::WholeWindow,
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        for v in 1..=4 {
            stage.process(0, json!(v)).unwrap();
        }
        assert!(capture.emitted().is_empty());
        stage.process(1, json!("x")).unwrap();
        assert_eq!(capture.tuples(0), vec![json!("x[2, 3, 4]")]);

        // Both inputs must be final before the marker goes out.
        stage.process_end_of_stream(0).unwrap();
        assert_eq!(capture.end_of_stream_count(0), 0);
        stage.process_end_of_stream(1).unwrap();
        assert_eq!(capture.end_of_stream_count(0), 1);
    }

    #[test]
    fn partitioned_join_matches_probe_key() {
        let capture = CaptureDownstream::new();
        let mut params = windowed("join-keyed", PolicyParams::Count { size: 10 });
        params.keyed = true;
        let stage = FunctionStage::join(
            params,
            LogicSpec::stateless(|| {
                Function::<(String, char), (u32, Vec<char>), u32>::join(|probe, window| {
                    Ok(Some((probe, window.iter().map(|(_, v)| *v).collect())))
                })
            }),
            Partitioner::keyed(|(key, _): &(String, char)| Ok(key.clone())),
            JoinStrategy::partitioned(|probe: &u32| Ok(format!("k{probe}"))),
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        stage.process(0, json!(["k1", "a"])).unwrap();
        stage.process(0, json!(["k2", "b"])).unwrap();
        stage.process(1, json!(1)).unwrap();
        stage.process(1, json!(3)).unwrap();
        assert_eq!(
            capture.tuples(0),
            vec![json!([1, ["a"]]), json!([3, []])]
        );
    }

    #[test]
    fn join_rejects_trigger_policy() {
        let mut params = windowed("join-trigger", PolicyParams::Count { size: 3 });
        params.trigger = Some(PolicyParams::Count { size: 1 });
        let res = FunctionStage::join(
            params,
            LogicSpec::stateless(|| {
                Function::<u64, u64, u64>::join(|probe, _window| Ok(Some(probe)))
            }),
            Partitioner::unkeyed(),
            JoinStrategy::WholeWindow,
            StageIo::json(CaptureDownstream::new()),
            env(),
        );
        assert!(matches!(res, Err(StageError::Config(_))));
    }

    /// Counts elements and exposes the count as a gauge.
    struct Counting {
        count: Arc<AtomicI64>,
    }

    impl Logic for Counting {
        fn initialize(&mut self, ctx: &FunctionContext) -> LogicResult<()> {
            let count = self.count.clone();
            ctx.create_gauge("count", "elements seen", move || {
                count.load(Ordering::SeqCst)
            })?;
            Ok(())
        }
    }

    impl MapLogic<u64, u64> for Counting {
        fn apply(&mut self, value: u64) -> LogicResult<Option<u64>> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(Some(value))
        }
    }

    #[test]
    fn metrics_reflect_final_state_after_end_of_stream() {
        let stage = FunctionStage::pipe(
            StageParams::new("pipe-metrics"),
            LogicSpec::stateless(|| {
                Function::<u64, u64>::Map(Box::new(Counting {
                    count: Arc::new(AtomicI64::new(0)),
                }))
            }),
            StageIo::json(CaptureDownstream::new()),
            env(),
        )
        .unwrap();
        let metrics = stage.metrics().clone();
        assert_eq!(metrics.value("count"), Some(0));
        assert!(metrics.is_refreshing());

        for v in 0..3 {
            stage.process(0, json!(v)).unwrap();
        }
        stage.process_end_of_stream(0).unwrap();
        assert_eq!(metrics.value("count"), Some(3));
        assert!(!metrics.is_refreshing());
        assert_eq!(metrics.custom_metric_names(), vec!["count".to_string()]);
    }

    /// Aggregates and counts its own invocations.
    struct Tally {
        calls: u64,
    }

    impl Logic for Tally {
        fn snapshot(&self) -> LogicResult<StateBytes> {
            Ok(StateBytes::ser(&self.calls)?)
        }
    }

    impl AggregateLogic<u64, (u64, u64)> for Tally {
        fn aggregate(&mut self, window: &[u64]) -> LogicResult<Option<(u64, u64)>> {
            self.calls += 1;
            Ok(Some((self.calls, window.iter().sum())))
        }
    }

    #[test]
    fn checkpoint_and_reset_restore_window_and_logic() {
        let capture = CaptureDownstream::new();
        let mut params = windowed("agg-checkpoint", PolicyParams::Count { size: 3 });
        params.checkpoint = CheckpointMode::Periodic;
        let stage = FunctionStage::aggregate(
            params,
            LogicSpec::<u64, (u64, u64)>::serde(&0_u64, |calls| {
                Ok(Function::Aggregate(Box::new(Tally { calls })))
            })
            .unwrap(),
            Partitioner::unkeyed(),
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        assert!(stage.handler().is_stateful());

        stage.process(0, json!(1)).unwrap();
        stage.process(0, json!(2)).unwrap();
        let snapshot = stage.checkpoint(RecoveryBoundary(1)).unwrap();
        assert_eq!(snapshot.boundary, RecoveryBoundary(1));

        stage.process(0, json!(3)).unwrap();
        stage.reset(&snapshot).unwrap();
        stage.process(0, json!(4)).unwrap();

        stage.reset_to_initial_state().unwrap();
        assert_eq!(stage.partition_count(), Some(0));
        stage.process(0, json!(5)).unwrap();

        assert_eq!(
            capture.tuples(0),
            vec![
                json!([1, 1]),
                json!([2, 3]),
                json!([3, 6]),
                json!([3, 7]),
                json!([1, 5]),
            ]
        );
    }

    #[test]
    fn reset_rejects_foreign_snapshot() {
        let stage = FunctionStage::pipe(
            StageParams::new("pipe-foreign"),
            LogicSpec::stateless(|| Function::<u64, u64>::map(Ok)),
            StageIo::json(CaptureDownstream::new()),
            env(),
        )
        .unwrap();
        let snapshot = CheckpointSnapshot {
            stage: StepId::from("someone-else"),
            boundary: RecoveryBoundary(1),
            state: StateBytes::ser(&()).unwrap(),
        };
        assert!(matches!(
            stage.reset(&snapshot),
            Err(StageError::Recovery(_))
        ));
        // Recovery errors don't fail the stage.
        stage.process(0, json!(1)).unwrap();
    }

    /// Counts how often two threads were inside it at once.
    struct Exclusive {
        busy: Arc<AtomicBool>,
        overlaps: Arc<AtomicUsize>,
        calls: u64,
    }

    fn exclusively<X>(busy: &AtomicBool, overlaps: &AtomicUsize, f: impl FnOnce() -> X) -> X {
        if busy.swap(true, Ordering::SeqCst) {
            overlaps.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(Duration::from_micros(50));
        let res = f();
        busy.store(false, Ordering::SeqCst);
        res
    }

    impl Logic for Exclusive {
        fn initialize(&mut self, ctx: &FunctionContext) -> LogicResult<()> {
            let busy = self.busy.clone();
            let overlaps = self.overlaps.clone();
            ctx.create_gauge("exclusive", "gauge reads", move || {
                exclusively(&busy, &overlaps, || 0)
            })?;
            Ok(())
        }

        fn snapshot(&self) -> LogicResult<StateBytes> {
            exclusively(&self.busy, &self.overlaps, || -> LogicResult<StateBytes> {
                Ok(StateBytes::ser(&self.calls)?)
            })
        }
    }

    impl JoinLogic<u64, u64, u64> for Exclusive {
        fn join(&mut self, probe: u64, _window: &[u64]) -> LogicResult<Option<u64>> {
            let (busy, overlaps) = (self.busy.clone(), self.overlaps.clone());
            exclusively(&busy, &overlaps, || {
                self.calls += 1;
                Ok(Some(probe))
            })
        }
    }

    #[test]
    fn logic_never_runs_on_two_threads_at_once() {
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let capture = CaptureDownstream::new();
        let mut params = windowed("join-exclusive", PolicyParams::Count { size: 5 });
        params.checkpoint = CheckpointMode::Periodic;
        params.metrics_refresh_ms = 1;
        let spec = {
            let busy = busy.clone();
            let overlaps = overlaps.clone();
            LogicSpec::<u64, u64, u64>::serde(&0_u64, move |calls| {
                Ok(Function::Join(Box::new(Exclusive {
                    busy: busy.clone(),
                    overlaps: overlaps.clone(),
                    calls,
                })))
            })
            .unwrap()
        };
        let stage = FunctionStage::join(
            params,
            spec,
            Partitioner::unkeyed(),
            JoinStrategy::WholeWindow,
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        assert!(stage.handler().is_stateful());

        // One thread fills the window, two others probe it.
        let inputs: Vec<_> = [0_usize, 1, 1]
            .into_iter()
            .map(|port| {
                let stage = stage.clone();
                std::thread::spawn(move || {
                    for v in 0..50_u64 {
                        stage.process(port, json!(v)).unwrap();
                    }
                })
            })
            .collect();
        let checkpoints = {
            let stage = stage.clone();
            std::thread::spawn(move || {
                for boundary in 1..=20 {
                    stage.checkpoint(RecoveryBoundary(boundary)).unwrap();
                }
            })
        };
        for input in inputs {
            input.join().unwrap();
        }
        checkpoints.join().unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(capture.tuples(0).len(), 100);
        stage.shutdown();
    }

    struct Countdown {
        left: u64,
    }

    impl Logic for Countdown {}

    impl SourceLogic<u64> for Countdown {
        fn next(&mut self) -> LogicResult<Option<u64>> {
            if self.left == 0 {
                return Ok(None);
            }
            self.left -= 1;
            Ok(Some(self.left + 1))
        }
    }

    #[test]
    fn source_produces_until_exhausted() {
        let capture = CaptureDownstream::new();
        let stage = FunctionStage::<(), u64>::source(
            StageParams::new("source"),
            LogicSpec::stateless(|| Function::Source(Box::new(Countdown { left: 3 }))),
            StageIo::json(capture.clone()),
            env(),
        )
        .unwrap();
        assert_eq!(stage.input_count(), 0);
        stage.all_inputs_ready().unwrap();
        assert!(capture.wait_for(4, Duration::from_secs(5)));
        assert_eq!(values(&capture), vec![3, 2, 1]);
        assert_eq!(capture.end_of_stream_count(0), 1);
        // The exhausted source's logic was closed before the marker.
        assert_eq!(stage.handler().state(), HandlerState::Closed);

        stage.shutdown();
        assert!(matches!(
            stage.all_inputs_ready(),
            Err(StageError::Shutdown(_))
        ));
    }
}
