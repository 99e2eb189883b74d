//! Ownership of the one logic instance of a stage.
//!
//! The [`LogicHandler`] holds the current [`Function`] in a slot
//! behind a single mutex. Invocation, checkpointing, reset and metric
//! refreshes all take that lock, so user logic never runs on two
//! threads at once and a snapshot always sees a quiescent instance.
//!
//! A handler is either stateless or stateful:
//!
//! - Stateless handlers build the logic once, at stage
//!   initialization, and never take part in checkpointing.
//!
//! - Stateful handlers are used when checkpointing or a consistent
//!   region applies and the logic is not immutable. They follow
//!
//!   ```text
//!   Uninitialized --reset_to_initial_state--> Active
//!   Active --checkpoint--> Active
//!   Active --reset(snapshot)--> Active
//!   Active --close--> Closed
//!   ```
//!
//!   A reset never mutates the instance: the old one is closed and a
//!   replacement is built from the [`LogicSpec`] or the snapshot, all under
//!   the slot lock.

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::KeyValue;

use super::Call;
use super::Emit;
use super::Function;
use super::FunctionContext;
use super::FunctionKind;
use super::LogicSpec;
use crate::common::lock;
use crate::config::StageParams;
use crate::errors::panic_err;
use crate::errors::StageError;
use crate::errors::StageResult;
use crate::metrics::Refresh;
use crate::metrics::Refresher;
use crate::recovery::StateBytes;
use crate::recovery::StepId;
use crate::with_timer;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandlerState {
    Uninitialized,
    Active,
    Closed,
}

struct Slot<T, R, U> {
    state: HandlerState,
    logic: Option<Function<T, R, U>>,
}

impl<T, R, U> Slot<T, R, U> {
    fn active(&mut self, stage: &StepId) -> StageResult<&mut Function<T, R, U>> {
        match (self.state, self.logic.as_mut()) {
            (HandlerState::Active, Some(logic)) => Ok(logic),
            (HandlerState::Closed, _) => Err(StageError::Shutdown(format!("logic of stage {stage}"))),
            _ => Err(StageError::logic(format!(
                "logic of stage {stage} is not initialized"
            ))),
        }
    }
}

pub struct LogicHandler<T, R, U = ()> {
    stage: StepId,
    spec: LogicSpec<T, R, U>,
    stateful: bool,
    kind: FunctionKind,
    context: FunctionContext,
    slot: Mutex<Slot<T, R, U>>,
    invocations: Counter<u64>,
    emitted: Counter<u64>,
    invoke_duration: Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl<T, R, U> LogicHandler<T, R, U>
where
    T: 'static,
    R: 'static,
    U: 'static,
{
    /// Build the handler for a stage.
    ///
    /// The initial logic is built once to decide which variant to
    /// use. A stateful handler closes that instance again and, on a
    /// first launch, eagerly resets to the initial state. On a
    /// relaunch it waits for the host to reset it.
    pub fn new(
        spec: LogicSpec<T, R, U>,
        params: &StageParams,
        context: FunctionContext,
    ) -> StageResult<Arc<Self>> {
        let stage = context.stage().clone();
        let mut initial = spec.build_initial()?;
        let kind = initial.kind();
        let stateful = params.is_fault_tolerant() && !initial.is_immutable();

        let slot = if stateful {
            if let Err(err) = snapshot(&initial, &stage) {
                initial.close(&stage);
                return Err(StageError::config(format!(
                    "{kind} logic of stage {stage} is stateful but can't be checkpointed: {err}"
                )));
            }
            initial.close(&stage);
            Slot {
                state: HandlerState::Uninitialized,
                logic: None,
            }
        } else {
            initial.initialize(&context)?;
            Slot {
                state: HandlerState::Active,
                logic: Some(initial),
            }
        };

        let meter = opentelemetry::global::meter("functional_stage");
        let invocations = meter
            .u64_counter("logic_invocation_count")
            .with_description("number of times the logic of this stage was invoked")
            .init();
        let emitted = meter
            .u64_counter("item_out_count")
            .with_description("number of items this stage has emitted")
            .init();
        let invoke_duration = meter
            .f64_histogram("logic_invoke_duration_seconds")
            .with_description("logic invocation duration in seconds")
            .init();
        let labels = vec![
            KeyValue::new("stage", stage.0.clone()),
            KeyValue::new("kind", kind.as_str()),
        ];

        tracing::info!(
            "Stage {stage} uses a {} handler for {kind} logic",
            if stateful { "stateful" } else { "stateless" }
        );
        let handler = Arc::new(Self {
            stage,
            spec,
            stateful,
            kind,
            context,
            slot: Mutex::new(slot),
            invocations,
            emitted,
            invoke_duration,
            labels,
        });
        let refresher: Weak<dyn Refresher> = Arc::downgrade(&handler) as Weak<dyn Refresher>;
        handler.context.metrics().bind_refresher(refresher);

        if stateful && params.relaunch_count == 0 {
            handler.reset_to_initial_state()?;
        }
        Ok(handler)
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn state(&self) -> HandlerState {
        lock(&self.slot).state
    }

    pub fn context(&self) -> &FunctionContext {
        &self.context
    }

    /// Run `f` on the current logic instance.
    pub fn with_logic<X>(&self, f: impl FnOnce(&mut Function<T, R, U>) -> X) -> StageResult<X> {
        let mut slot = lock(&self.slot);
        Ok(f(slot.active(&self.stage)?))
    }

    /// Invoke the logic, then hand what it produced to `route` while
    /// still holding the lock so emission order matches invocation
    /// order.
    pub(crate) fn invoke<X>(
        &self,
        call: Call<'_, T, U>,
        route: impl FnOnce(Emit<R>) -> StageResult<X>,
    ) -> StageResult<X> {
        let mut slot = lock(&self.slot);
        let logic = slot.active(&self.stage)?;
        self.invocations.add(1, &self.labels);
        let emit = with_timer!(self.invoke_duration, self.labels, logic.invoke(call))?;
        self.emitted.add(emit.len() as u64, &self.labels);
        route(emit)
    }

    /// Replace the logic with one built from the initial spec.
    pub fn reset_to_initial_state(&self) -> StageResult<()> {
        if !self.stateful {
            return Ok(());
        }
        tracing::debug!("Resetting logic of stage {} to initial state", self.stage);
        self.swap(self.spec.initial())
    }

    /// Snapshot the current logic instance.
    ///
    /// Stateless handlers have nothing to snapshot.
    pub fn checkpoint(&self) -> StageResult<Option<StateBytes>> {
        if !self.stateful {
            return Ok(None);
        }
        let mut slot = lock(&self.slot);
        let logic = slot.active(&self.stage)?;
        let state = snapshot(logic, &self.stage)?;
        tracing::debug!(
            "Checkpointed logic of stage {} in {} bytes",
            self.stage,
            state.len()
        );
        Ok(Some(state))
    }

    /// Replace the logic with one built from a snapshot.
    pub fn reset(&self, state: &StateBytes) -> StageResult<()> {
        if !self.stateful {
            return Ok(());
        }
        tracing::debug!("Resetting logic of stage {} from snapshot", self.stage);
        self.swap(state)
    }

    fn swap(&self, state: &StateBytes) -> StageResult<()> {
        let mut slot = lock(&self.slot);
        if slot.state == HandlerState::Closed {
            return Err(StageError::Shutdown(format!("logic of stage {}", self.stage)));
        }
        // Suppliers of the old instance must not outlive it.
        self.context.metrics().unbind_logic_gauges();
        if let Some(mut old) = slot.logic.take() {
            old.close(&self.stage);
        }
        slot.state = HandlerState::Uninitialized;

        let mut logic = self.spec.build_from(state)?;
        logic.initialize(&self.context).map_err(|err| {
            StageError::recovery(format!(
                "error initializing restored logic of stage {}: {err}",
                self.stage
            ))
        })?;
        slot.logic = Some(logic);
        slot.state = HandlerState::Active;
        Ok(())
    }

    /// Close the logic. No invocation is accepted afterwards.
    pub fn close(&self) {
        let mut slot = lock(&self.slot);
        if let Some(mut logic) = slot.logic.take() {
            logic.close(&self.stage);
        }
        slot.state = HandlerState::Closed;
    }
}

fn snapshot<T, R, U>(logic: &Function<T, R, U>, stage: &StepId) -> StageResult<StateBytes>
where
    T: 'static,
    R: 'static,
    U: 'static,
{
    let kind = logic.kind();
    match catch_unwind(AssertUnwindSafe(|| logic.snapshot())) {
        Ok(Ok(state)) => Ok(state),
        Ok(Err(err)) => Err(StageError::recovery(format!(
            "error checkpointing {kind} logic of stage {stage}: {err}"
        ))),
        Err(payload) => Err(StageError::recovery(
            panic_err(&format!("{kind} logic snapshot"), payload).to_string(),
        )),
    }
}

impl<T, R, U> Refresher for LogicHandler<T, R, U>
where
    T: 'static,
    R: 'static,
    U: 'static,
{
    fn refresh_metrics(&self, kind: Refresh) {
        let _slot = lock(&self.slot);
        self.context.metrics().update(kind);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::CheckpointMode;
    use crate::errors::LogicResult;
    use crate::logic::Logic;
    use crate::logic::MapLogic;
    use crate::testing::function_context;

    /// Numbers each element and exposes the count as a gauge.
    struct Numbering {
        count: u64,
        gauge: Arc<AtomicI64>,
    }

    impl Logic for Numbering {
        fn initialize(&mut self, ctx: &FunctionContext) -> LogicResult<()> {
            let gauge = self.gauge.clone();
            ctx.create_gauge("count", "elements seen", move || gauge.load(Ordering::SeqCst))?;
            Ok(())
        }

        fn snapshot(&self) -> LogicResult<StateBytes> {
            Ok(StateBytes::ser(&self.count)?)
        }
    }

    impl MapLogic<String, String> for Numbering {
        fn apply(&mut self, value: String) -> LogicResult<Option<String>> {
            self.count += 1;
            self.gauge.store(self.count as i64, Ordering::SeqCst);
            Ok(Some(format!("{}:{value}", self.count)))
        }
    }

    fn numbering_spec() -> LogicSpec<String, String> {
        LogicSpec::serde(&0_u64, |count| {
            Ok(Function::Map(Box::new(Numbering {
                count,
                gauge: Arc::new(AtomicI64::new(count as i64)),
            })))
        })
        .unwrap()
    }

    fn checkpointed(name: &str) -> StageParams {
        let mut params = StageParams::new(name);
        params.checkpoint = CheckpointMode::Periodic;
        params
    }

    fn call(handler: &LogicHandler<String, String>, value: &str) -> StageResult<Vec<String>> {
        handler.invoke(Call::Element(value.to_string()), |emit| Ok(emit.into_vec()))
    }

    #[test]
    fn stateless_without_fault_tolerance() {
        let params = StageParams::new("h-stateless");
        let ctx = function_context("h-stateless").unwrap();
        let handler = LogicHandler::new(numbering_spec(), &params, ctx).unwrap();
        assert!(!handler.is_stateful());
        assert_eq!(handler.state(), HandlerState::Active);
        assert_eq!(call(&handler, "a").unwrap(), vec!["1:a"]);
        assert_eq!(handler.checkpoint().unwrap(), None);
        handler.reset(&StateBytes::ser(&10_u64).unwrap()).unwrap();
        assert_eq!(call(&handler, "b").unwrap(), vec!["2:b"]);
    }

    #[test]
    fn immutable_logic_stays_stateless() {
        let spec = LogicSpec::stateless(|| Function::<u64, u64>::map(|v| Ok(v + 1)));
        let ctx = function_context("h-immutable").unwrap();
        let handler = LogicHandler::new(spec, &checkpointed("h-immutable"), ctx).unwrap();
        assert!(!handler.is_stateful());
    }

    #[test]
    fn unsnapshottable_stateful_logic_is_config_error() {
        struct Opaque;
        impl Logic for Opaque {}
        impl MapLogic<u64, u64> for Opaque {
            fn apply(&mut self, value: u64) -> LogicResult<Option<u64>> {
                Ok(Some(value))
            }
        }
        let spec = LogicSpec::stateless(|| Function::<u64, u64>::Map(Box::new(Opaque)));
        let ctx = function_context("h-opaque").unwrap();
        let res = LogicHandler::new(spec, &checkpointed("h-opaque"), ctx);
        assert!(matches!(res, Err(StageError::Config(_))));
    }

    #[test]
    fn relaunch_waits_for_reset() {
        let mut params = checkpointed("h-relaunch");
        params.relaunch_count = 1;
        let ctx = function_context("h-relaunch").unwrap();
        let handler = LogicHandler::new(numbering_spec(), &params, ctx).unwrap();
        assert_eq!(handler.state(), HandlerState::Uninitialized);
        assert!(matches!(call(&handler, "a"), Err(StageError::Logic(_))));

        handler.reset_to_initial_state().unwrap();
        assert_eq!(handler.state(), HandlerState::Active);
        assert_eq!(call(&handler, "a").unwrap(), vec!["1:a"]);
    }

    #[test]
    fn checkpoint_round_trip_is_equivalent() {
        let handler = LogicHandler::new(
            numbering_spec(),
            &checkpointed("h-round-trip"),
            function_context("h-round-trip").unwrap(),
        )
        .unwrap();
        let twin = LogicHandler::new(
            numbering_spec(),
            &checkpointed("h-round-trip-twin"),
            function_context("h-round-trip-twin").unwrap(),
        )
        .unwrap();
        for value in ["a", "b"] {
            call(&handler, value).unwrap();
            call(&twin, value).unwrap();
        }

        let state = handler.checkpoint().unwrap().unwrap();
        handler.reset(&state).unwrap();
        for value in ["c", "d"] {
            assert_eq!(call(&handler, value).unwrap(), call(&twin, value).unwrap());
        }
    }

    #[test]
    fn failed_reset_blocks_invocation() {
        let handler = LogicHandler::new(
            numbering_spec(),
            &checkpointed("h-bad-reset"),
            function_context("h-bad-reset").unwrap(),
        )
        .unwrap();
        let err = handler.reset(&StateBytes(b"garbage".to_vec())).unwrap_err();
        assert!(matches!(err, StageError::Recovery(_)));
        assert_eq!(handler.state(), HandlerState::Uninitialized);
        assert!(call(&handler, "a").is_err());

        handler.reset(&StateBytes::ser(&41_u64).unwrap()).unwrap();
        assert_eq!(call(&handler, "a").unwrap(), vec!["42:a"]);
    }

    #[test]
    fn gauges_rebound_after_reset() {
        let ctx = function_context("h-gauges").unwrap();
        let metrics = ctx.metrics().clone();
        let handler = LogicHandler::new(numbering_spec(), &checkpointed("h-gauges"), ctx).unwrap();
        call(&handler, "a").unwrap();
        call(&handler, "b").unwrap();
        let state = handler.checkpoint().unwrap().unwrap();

        handler.reset_to_initial_state().unwrap();
        metrics.update(Refresh::Periodic);
        assert_eq!(metrics.value("count"), Some(0));

        handler.reset(&state).unwrap();
        metrics.update(Refresh::Periodic);
        assert_eq!(metrics.value("count"), Some(2));
    }

    #[test]
    fn closed_handler_rejects_work() {
        let handler = LogicHandler::new(
            numbering_spec(),
            &checkpointed("h-closed"),
            function_context("h-closed").unwrap(),
        )
        .unwrap();
        handler.close();
        assert_eq!(handler.state(), HandlerState::Closed);
        assert!(matches!(call(&handler, "a"), Err(StageError::Shutdown(_))));
        assert!(matches!(
            handler.reset_to_initial_state(),
            Err(StageError::Shutdown(_))
        ));
    }
}
