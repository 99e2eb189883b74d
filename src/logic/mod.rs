//! User logic.
//!
//! Every stage runs exactly one piece of user logic. What the stage
//! does with it depends on its kind, which is one of the variants of
//! [`Function`]:
//!
//! - [`MapLogic`]: one element in, zero or one out. Filters are maps
//!   that return the element or nothing.
//! - [`FlatMapLogic`]: one element in, any number out.
//! - [`SinkLogic`]: one element in, nothing out.
//! - [`AggregateLogic`]: window contents in, zero or one out.
//! - [`JoinLogic`]: a probe element and window contents in, zero or
//!   one out.
//! - [`SourceLogic`]: nothing in, elements out until exhausted.
//!
//! All kinds share the [`Logic`] base trait, which is how the stage
//! initializes, snapshots and closes an instance.
//!
//! Logic is always built from a [`LogicSpec`]: a serialized initial
//! state plus a builder. The same builder is used to rebuild logic
//! from a checkpoint snapshot, so a stateful instance is never
//! mutated in place by recovery; it is replaced.

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ConfigContext;
use crate::errors::logic_err;
use crate::errors::panic_err;
use crate::errors::LogicError;
use crate::errors::LogicResult;
use crate::errors::StageError;
use crate::errors::StageResult;
use crate::metrics::MetricsReporter;
use crate::recovery::StateBytes;
use crate::recovery::StepId;

pub mod handler;

pub use handler::HandlerState;
pub use handler::LogicHandler;

/// What the stage gives logic when it is initialized.
#[derive(Clone)]
pub struct FunctionContext {
    stage: StepId,
    channel: i32,
    max_channels: i32,
    config: Arc<ConfigContext>,
    metrics: Arc<MetricsReporter>,
}

impl FunctionContext {
    pub fn new(
        stage: StepId,
        channel: i32,
        max_channels: i32,
        config: Arc<ConfigContext>,
        metrics: Arc<MetricsReporter>,
    ) -> Self {
        Self {
            stage,
            channel,
            max_channels,
            config,
            metrics,
        }
    }

    pub fn stage(&self) -> &StepId {
        &self.stage
    }

    /// Index of this stage among its parallel channels.
    pub fn channel(&self) -> i32 {
        self.channel
    }

    pub fn max_channels(&self) -> i32 {
        self.max_channels
    }

    pub fn config(&self) -> &ConfigContext {
        &self.config
    }

    /// Register a gauge whose value is polled from `supplier`.
    ///
    /// Logic must register its gauges again every time it is
    /// initialized; suppliers of a replaced instance are dropped.
    pub fn create_gauge<F>(&self, name: &str, description: &str, supplier: F) -> StageResult<()>
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.metrics
            .create_gauge(name, description, Box::new(supplier))
    }

    pub fn custom_metric_names(&self) -> Vec<String> {
        self.metrics.custom_metric_names()
    }

    pub fn metrics(&self) -> &Arc<MetricsReporter> {
        &self.metrics
    }
}

/// Base of every kind of user logic.
pub trait Logic: Send + 'static {
    /// Called once before the first invocation of this instance.
    fn initialize(&mut self, _ctx: &FunctionContext) -> LogicResult<()> {
        Ok(())
    }

    /// Serialize all the state needed to rebuild this instance with
    /// its [`LogicSpec`] builder.
    fn snapshot(&self) -> LogicResult<StateBytes> {
        Err(format!(
            "{} does not support checkpointing",
            std::any::type_name::<Self>()
        )
        .into())
    }

    /// Logic that has no mutable state never takes part in
    /// checkpointing.
    fn is_immutable(&self) -> bool {
        false
    }

    /// Release resources. Errors are logged by the caller and
    /// otherwise ignored.
    fn close(&mut self) -> LogicResult<()> {
        Ok(())
    }
}

pub trait MapLogic<T, R>: Logic {
    fn apply(&mut self, value: T) -> LogicResult<Option<R>>;
}

pub trait FlatMapLogic<T, R>: Logic {
    fn apply(&mut self, value: T) -> LogicResult<Vec<R>>;
}

pub trait SinkLogic<T>: Logic {
    fn accept(&mut self, value: T) -> LogicResult<()>;
}

pub trait AggregateLogic<T, R>: Logic {
    /// `window` is the partition contents, oldest first.
    fn aggregate(&mut self, window: &[T]) -> LogicResult<Option<R>>;
}

pub trait JoinLogic<U, T, R>: Logic {
    /// `window` holds the buffered elements matching `probe`, oldest
    /// first, and is empty if there are none.
    fn join(&mut self, probe: U, window: &[T]) -> LogicResult<Option<R>>;
}

pub trait SourceLogic<R>: Logic {
    /// `None` once the source is exhausted.
    fn next(&mut self) -> LogicResult<Option<R>>;
}

/// Wraps a plain closure as immutable logic.
pub struct Stateless<F>(pub F);

impl<F> Logic for Stateless<F>
where
    F: Send + 'static,
{
    fn snapshot(&self) -> LogicResult<StateBytes> {
        Ok(StateBytes::empty())
    }

    fn is_immutable(&self) -> bool {
        true
    }
}

impl<T, R, F> MapLogic<T, R> for Stateless<F>
where
    F: Fn(T) -> LogicResult<Option<R>> + Send + 'static,
{
    fn apply(&mut self, value: T) -> LogicResult<Option<R>> {
        (self.0)(value)
    }
}

impl<T, R, F> FlatMapLogic<T, R> for Stateless<F>
where
    F: Fn(T) -> LogicResult<Vec<R>> + Send + 'static,
{
    fn apply(&mut self, value: T) -> LogicResult<Vec<R>> {
        (self.0)(value)
    }
}

impl<T, F> SinkLogic<T> for Stateless<F>
where
    F: Fn(T) -> LogicResult<()> + Send + 'static,
{
    fn accept(&mut self, value: T) -> LogicResult<()> {
        (self.0)(value)
    }
}

impl<T, R, F> AggregateLogic<T, R> for Stateless<F>
where
    F: Fn(&[T]) -> LogicResult<Option<R>> + Send + 'static,
{
    fn aggregate(&mut self, window: &[T]) -> LogicResult<Option<R>> {
        (self.0)(window)
    }
}

impl<U, T, R, F> JoinLogic<U, T, R> for Stateless<F>
where
    F: Fn(U, &[T]) -> LogicResult<Option<R>> + Send + 'static,
{
    fn join(&mut self, probe: U, window: &[T]) -> LogicResult<Option<R>> {
        (self.0)(probe, window)
    }
}

/// The kind of a [`Function`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FunctionKind {
    Map,
    FlatMap,
    Sink,
    Aggregate,
    Join,
    Source,
}

impl FunctionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Map => "map",
            Self::FlatMap => "flat_map",
            Self::Sink => "sink",
            Self::Aggregate => "aggregate",
            Self::Join => "join",
            Self::Source => "source",
        }
    }
}

impl std::fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instance of user logic, tagged with its kind.
///
/// `T` is the element type of the main input (or the buffered side
/// of a join), `R` the output type and `U` the probe type of a join.
pub enum Function<T, R, U = ()> {
    Map(Box<dyn MapLogic<T, R>>),
    FlatMap(Box<dyn FlatMapLogic<T, R>>),
    Sink(Box<dyn SinkLogic<T>>),
    Aggregate(Box<dyn AggregateLogic<T, R>>),
    Join(Box<dyn JoinLogic<U, T, R>>),
    Source(Box<dyn SourceLogic<R>>),
}

/// Run the same expression on the [`Logic`] part of every variant.
macro_rules! each_logic {
    ($function:expr, $logic:ident => $body:expr) => {
        match $function {
            Function::Map($logic) => $body,
            Function::FlatMap($logic) => $body,
            Function::Sink($logic) => $body,
            Function::Aggregate($logic) => $body,
            Function::Join($logic) => $body,
            Function::Source($logic) => $body,
        }
    };
}

/// Input to one invocation of a [`Function`].
pub(crate) enum Call<'a, T, U> {
    Element(T),
    Window(&'a [T]),
    Probe(U, &'a [T]),
    Pull,
}

impl<T, U> Call<'_, T, U> {
    fn name(&self) -> &'static str {
        match self {
            Self::Element(_) => "element",
            Self::Window(_) => "window",
            Self::Probe(..) => "probe",
            Self::Pull => "pull",
        }
    }
}

/// What one invocation produced.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Emit<R> {
    Nothing,
    One(R),
    Many(Vec<R>),
    /// A source has no more elements.
    Exhausted,
}

impl<R> Emit<R> {
    fn from_option(value: Option<R>) -> Self {
        value.map_or(Self::Nothing, Self::One)
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Nothing | Self::Exhausted => 0,
            Self::One(_) => 1,
            Self::Many(values) => values.len(),
        }
    }

    pub(crate) fn into_vec(self) -> Vec<R> {
        match self {
            Self::Nothing | Self::Exhausted => Vec::new(),
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

impl<T, R, U> Function<T, R, U>
where
    T: 'static,
    R: 'static,
    U: 'static,
{
    pub fn map<F>(f: F) -> Self
    where
        F: Fn(T) -> LogicResult<R> + Send + 'static,
    {
        Self::Map(Box::new(Stateless(move |value: T| f(value).map(Some))))
    }

    pub fn flat_map<F>(f: F) -> Self
    where
        F: Fn(T) -> LogicResult<Vec<R>> + Send + 'static,
    {
        Self::FlatMap(Box::new(Stateless(f)))
    }

    pub fn sink<F>(f: F) -> Self
    where
        F: Fn(T) -> LogicResult<()> + Send + 'static,
    {
        Self::Sink(Box::new(Stateless(f)))
    }

    pub fn aggregate<F>(f: F) -> Self
    where
        F: Fn(&[T]) -> LogicResult<Option<R>> + Send + 'static,
    {
        Self::Aggregate(Box::new(Stateless(f)))
    }

    pub fn join<F>(f: F) -> Self
    where
        F: Fn(U, &[T]) -> LogicResult<Option<R>> + Send + 'static,
    {
        Self::Join(Box::new(Stateless(f)))
    }

    pub fn kind(&self) -> FunctionKind {
        match self {
            Self::Map(_) => FunctionKind::Map,
            Self::FlatMap(_) => FunctionKind::FlatMap,
            Self::Sink(_) => FunctionKind::Sink,
            Self::Aggregate(_) => FunctionKind::Aggregate,
            Self::Join(_) => FunctionKind::Join,
            Self::Source(_) => FunctionKind::Source,
        }
    }

    pub fn is_immutable(&self) -> bool {
        each_logic!(self, logic => logic.is_immutable())
    }

    pub fn snapshot(&self) -> LogicResult<StateBytes> {
        each_logic!(self, logic => logic.snapshot())
    }

    pub(crate) fn initialize(&mut self, ctx: &FunctionContext) -> StageResult<()> {
        let kind = self.kind();
        let res = catch_unwind(AssertUnwindSafe(|| {
            each_logic!(self, logic => logic.initialize(ctx))
        }));
        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(logic_err(&format!("error initializing {kind} logic"), err)),
            Err(payload) => Err(panic_err(&format!("{kind} logic initialization"), payload)),
        }
    }

    /// Close the instance, logging instead of returning errors.
    pub(crate) fn close(&mut self, stage: &StepId) {
        let kind = self.kind();
        match catch_unwind(AssertUnwindSafe(|| each_logic!(self, logic => logic.close()))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!("Error closing {kind} logic of stage {stage}: {err}"),
            Err(_) => tracing::error!("Closing {kind} logic of stage {stage} panicked"),
        }
    }

    /// Invoke the logic and collect what it produced.
    pub(crate) fn invoke(&mut self, call: Call<'_, T, U>) -> StageResult<Emit<R>> {
        let kind = self.kind();
        let call_name = call.name();
        let res = catch_unwind(AssertUnwindSafe(|| -> Result<LogicResult<Emit<R>>, String> {
            Ok(match (self, call) {
                (Self::Map(logic), Call::Element(value)) => logic.apply(value).map(Emit::from_option),
                (Self::FlatMap(logic), Call::Element(value)) => logic.apply(value).map(Emit::Many),
                (Self::Sink(logic), Call::Element(value)) => logic.accept(value).map(|()| Emit::Nothing),
                (Self::Aggregate(logic), Call::Window(window)) => {
                    logic.aggregate(window).map(Emit::from_option)
                }
                (Self::Join(logic), Call::Probe(probe, window)) => {
                    logic.join(probe, window).map(Emit::from_option)
                }
                (Self::Source(logic), Call::Pull) => logic
                    .next()
                    .map(|next| next.map_or(Emit::Exhausted, Emit::One)),
                _ => return Err(format!("{kind} logic can't be invoked with a {call_name}")),
            })
        }));
        match res {
            Ok(Ok(Ok(emit))) => Ok(emit),
            Ok(Ok(Err(err))) => Err(logic_err(&format!("error calling {kind} logic"), err)),
            Ok(Err(msg)) => Err(StageError::config(msg)),
            Err(payload) => Err(panic_err(&format!("{kind} logic"), payload)),
        }
    }
}

impl<T, U> Function<T, T, U>
where
    T: 'static,
    U: 'static,
{
    /// A map that keeps the elements `predicate` accepts.
    pub fn filter<F>(predicate: F) -> Self
    where
        F: Fn(&T) -> LogicResult<bool> + Send + 'static,
    {
        Self::Map(Box::new(Stateless(move |value: T| {
            predicate(&value).map(|keep| keep.then_some(value))
        })))
    }
}

/// Builds a [`Function`] from serialized state.
pub type LogicBuilder<T, R, U> =
    Arc<dyn Fn(&StateBytes) -> LogicResult<Function<T, R, U>> + Send + Sync>;

/// The initial serialized logic of a stage and how to build it.
pub struct LogicSpec<T, R, U = ()> {
    initial: StateBytes,
    builder: LogicBuilder<T, R, U>,
}

impl<T, R, U> Clone for LogicSpec<T, R, U> {
    fn clone(&self) -> Self {
        Self {
            initial: self.initial.clone(),
            builder: self.builder.clone(),
        }
    }
}

impl<T, R, U> LogicSpec<T, R, U>
where
    T: 'static,
    R: 'static,
    U: 'static,
{
    pub fn new<B>(initial: StateBytes, builder: B) -> Self
    where
        B: Fn(&StateBytes) -> LogicResult<Function<T, R, U>> + Send + Sync + 'static,
    {
        Self {
            initial,
            builder: Arc::new(builder),
        }
    }

    /// Logic whose state is a serde type.
    ///
    /// `build` gets either `initial` or the state a snapshot was
    /// taken with.
    pub fn serde<S, B>(initial: &S, build: B) -> StageResult<Self>
    where
        S: Serialize + DeserializeOwned,
        B: Fn(S) -> LogicResult<Function<T, R, U>> + Send + Sync + 'static,
    {
        let initial = StateBytes::ser(initial)?;
        Ok(Self::new(initial, move |state: &StateBytes| {
            let state: S = state.de().map_err(|err| -> LogicError { Box::new(err) })?;
            build(state)
        }))
    }

    /// Logic without state. Every build produces a fresh instance
    /// from `factory`.
    pub fn stateless<B>(factory: B) -> Self
    where
        B: Fn() -> Function<T, R, U> + Send + Sync + 'static,
    {
        Self::new(StateBytes::empty(), move |_state: &StateBytes| Ok(factory()))
    }

    pub fn initial(&self) -> &StateBytes {
        &self.initial
    }

    /// Build from the initial state.
    pub fn build_initial(&self) -> StageResult<Function<T, R, U>> {
        self.build_with(&self.initial)
            .map_err(|err| StageError::config(format!("error building initial logic: {err}")))
    }

    /// Build from a snapshot.
    pub fn build_from(&self, state: &StateBytes) -> StageResult<Function<T, R, U>> {
        self.build_with(state)
            .map_err(|err| StageError::recovery(format!("error rebuilding logic from snapshot: {err}")))
    }

    fn build_with(&self, state: &StateBytes) -> Result<Function<T, R, U>, String> {
        match catch_unwind(AssertUnwindSafe(|| (self.builder)(state))) {
            Ok(Ok(function)) => Ok(function),
            Ok(Err(err)) => Err(err.to_string()),
            Err(payload) => Err(panic_err("logic builder", payload).to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        count: u64,
    }

    impl Logic for Counter {
        fn snapshot(&self) -> LogicResult<StateBytes> {
            Ok(StateBytes::ser(&self.count)?)
        }
    }

    impl MapLogic<String, (String, u64)> for Counter {
        fn apply(&mut self, value: String) -> LogicResult<Option<(String, u64)>> {
            self.count += 1;
            Ok(Some((value, self.count)))
        }
    }

    #[test]
    fn invoke_routes_by_kind() {
        let mut map = Function::<u64, u64>::map(|v| Ok(v * 2));
        assert_eq!(map.invoke(Call::Element(4)).unwrap(), Emit::One(8));
        assert!(map.is_immutable());

        let mut filter = Function::<u64, u64>::filter(|v| Ok(v % 2 == 0));
        assert_eq!(filter.invoke(Call::Element(3)).unwrap(), Emit::Nothing);
        assert_eq!(filter.invoke(Call::Element(2)).unwrap(), Emit::One(2));

        let mut flat = Function::<u64, u64>::flat_map(|v| Ok((0..v).collect()));
        assert_eq!(flat.invoke(Call::Element(3)).unwrap().into_vec(), vec![0, 1, 2]);

        let mut agg = Function::<u64, u64>::aggregate(|w| Ok(Some(w.iter().sum())));
        assert_eq!(agg.invoke(Call::Window(&[1, 2, 3])).unwrap(), Emit::One(6));

        let mut join = Function::<u64, String, char>::join(|probe, w| Ok(Some(format!("{probe}{w:?}"))));
        assert_eq!(
            join.invoke(Call::Probe('x', &[2, 3])).unwrap(),
            Emit::One("x[2, 3]".to_string())
        );
    }

    #[test]
    fn wrong_call_is_config_error() {
        let mut map = Function::<u64, u64>::map(|v| Ok(v));
        let err = map.invoke(Call::Window(&[1])).unwrap_err();
        assert!(matches!(err, StageError::Config(_)));
    }

    #[test]
    fn logic_errors_and_panics_are_caught() {
        let mut failing = Function::<u64, u64>::map(|_| Err("nope".into()));
        let err = failing.invoke(Call::Element(1)).unwrap_err();
        assert!(matches!(err, StageError::Logic(_)));
        assert!(err.to_string().contains("nope"));

        let mut panicking = Function::<u64, u64>::map(|_| panic!("kaboom"));
        let err = panicking.invoke(Call::Element(1)).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn spec_rebuilds_from_snapshot() {
        let spec = LogicSpec::<String, (String, u64)>::serde(&0_u64, |count| {
            Ok(Function::Map(Box::new(Counter { count })))
        })
        .unwrap();
        let mut logic = spec.build_initial().unwrap();
        logic.invoke(Call::Element("a".to_string())).unwrap();
        assert!(!logic.is_immutable());
        let snap = logic.snapshot().unwrap();

        let mut rebuilt = spec.build_from(&snap).unwrap();
        assert_eq!(
            rebuilt.invoke(Call::Element("b".to_string())).unwrap(),
            Emit::One(("b".to_string(), 2))
        );

        let err = spec.build_from(&StateBytes(b"oops".to_vec())).err().unwrap();
        assert!(matches!(err, StageError::Recovery(_)));
    }
}
