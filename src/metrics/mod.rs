//! Metrics.
//!
//! Two kinds of metrics come out of a stage:
//!
//! - Runtime metrics (invocation durations, element counts) recorded
//!   through the global OpenTelemetry meter, exported to the default
//!   Prometheus registry by [`initialize_metrics`].
//!
//! - Gauges that user logic registers through
//!   [`crate::logic::FunctionContext::create_gauge`]. Each gauge has a
//!   supplier closure bound to the logic instance that registered it.
//!   The [`MetricsReporter`] of the stage polls the suppliers: first
//!   at registration, then periodically once any gauge exists, and a
//!   final time at end of stream.
//!
//! Suppliers read logic state, so every refresh goes through a
//! [`Refresher`] (the logic handler) that holds the same lock as
//! element processing while [`MetricsReporter::update`] runs.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::Weak;
use std::time::Duration;

use opentelemetry::global;
use opentelemetry::sdk::metrics::{Aggregation, Instrument, MeterProvider, Stream};
use prometheus::default_registry;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;

use crate::common::lock;
use crate::errors::StageError;
use crate::errors::StageResult;
use crate::recovery::StepId;
use crate::timer::PeriodicTask;
use crate::timer::Timer;

/// Name of the gauge with the number of live window partitions.
pub const PARTITION_COUNT_GAUGE: &str = "nPartitions";

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> StageResult<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("functional_stage")
        .build()
        .map_err(|err| StageError::config(format!("error building metrics exporter: {err}")))?;

    // Create a global MeterProvider
    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| StageError::config(format!("error building metrics view: {err}")))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Computes the current value of a gauge.
pub type GaugeSupplier = Box<dyn Fn() -> i64 + Send + Sync>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Refresh {
    Periodic,
    /// The last refresh, after end of stream.
    Final,
}

/// Runs [`MetricsReporter::update`] while holding whatever lock
/// guards the state the suppliers read.
pub trait Refresher: Send + Sync {
    fn refresh_metrics(&self, kind: Refresh);
}

struct BoundGauge {
    gauge: IntGauge,
    supplier: GaugeSupplier,
}

#[derive(Default)]
struct ReporterState {
    /// Suppliers of the current logic instance.
    bound: BTreeMap<String, BoundGauge>,
    /// Every gauge ever registered. Survives logic swaps so a new
    /// instance can rebind by name.
    gauges: BTreeMap<String, IntGauge>,
    builtin: HashSet<String>,
    task: Option<PeriodicTask>,
    finalized: bool,
}

/// Publishes the gauges of one stage.
pub struct MetricsReporter {
    stage: StepId,
    registry: Registry,
    period: Duration,
    timer: Arc<Timer>,
    state: Mutex<ReporterState>,
    refresher: OnceLock<Weak<dyn Refresher>>,
}

impl MetricsReporter {
    pub fn new(stage: StepId, registry: Registry, timer: Arc<Timer>, period: Duration) -> Self {
        Self {
            stage,
            registry,
            period,
            timer,
            state: Mutex::new(ReporterState::default()),
            refresher: OnceLock::new(),
        }
    }

    /// Route refreshes through `refresher`. Only the first binding
    /// counts.
    pub fn bind_refresher(&self, refresher: Weak<dyn Refresher>) {
        if self.refresher.set(refresher).is_err() {
            tracing::warn!("Metrics of stage {} already have a refresher", self.stage);
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn register(&self, name: &str, description: &str) -> StageResult<IntGauge> {
        let opts = Opts::new(name, description).const_label("stage", self.stage.0.clone());
        let gauge = IntGauge::with_opts(opts)
            .map_err(|err| StageError::config(format!("invalid metric {name:?}: {err}")))?;
        match self.registry.register(Box::new(gauge.clone())) {
            Ok(()) => {}
            // Left over from an earlier stage with the same name.
            Err(prometheus::Error::AlreadyReg) => {
                self.registry.unregister(Box::new(gauge.clone()))?;
                self.registry.register(Box::new(gauge.clone()))?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(gauge)
    }

    /// Register a gauge owned by the stage itself rather than by
    /// user logic. It is never unbound.
    pub fn builtin_gauge(&self, name: &str, description: &str) -> StageResult<IntGauge> {
        let mut state = lock(&self.state);
        if state.gauges.contains_key(name) {
            return Err(StageError::config(format!("duplicate metric {name}")));
        }
        let gauge = self.register(name, description)?;
        state.gauges.insert(name.to_string(), gauge.clone());
        state.builtin.insert(name.to_string());
        Ok(gauge)
    }

    /// Register a gauge whose value comes from `supplier`.
    ///
    /// The supplier is called right away to set the initial value.
    /// A name can only be registered once per logic instance; a
    /// name registered by a previous instance is rebound to the new
    /// supplier.
    pub fn create_gauge(
        self: &Arc<Self>,
        name: &str,
        description: &str,
        supplier: GaugeSupplier,
    ) -> StageResult<()> {
        let mut state = lock(&self.state);
        if state.bound.contains_key(name) || state.builtin.contains(name) {
            return Err(StageError::config(format!("duplicate metric {name}")));
        }
        let gauge = match state.gauges.get(name) {
            Some(gauge) => {
                tracing::debug!("Rebinding metric {name} of stage {}", self.stage);
                gauge.clone()
            }
            None => {
                let gauge = self.register(name, description)?;
                state.gauges.insert(name.to_string(), gauge.clone());
                gauge
            }
        };
        set_from_supplier(name, &gauge, &supplier);
        state.bound.insert(name.to_string(), BoundGauge { gauge, supplier });

        if state.task.is_none() && !state.finalized {
            let this = Arc::downgrade(self);
            state.task = Some(
                self.timer
                    .schedule_with_fixed_delay(self.period, move || {
                        if let Some(this) = this.upgrade() {
                            this.refresh(Refresh::Periodic);
                        }
                    }),
            );
        }
        Ok(())
    }

    fn refresh(&self, kind: Refresh) {
        match self.refresher.get().and_then(Weak::upgrade) {
            Some(refresher) => refresher.refresh_metrics(kind),
            None => self.update(kind),
        }
    }

    /// Recompute every bound gauge from its supplier.
    ///
    /// Callers must hold the lock guarding the suppliers' state.
    /// Periodic updates are skipped after [`Self::finalize`].
    pub fn update(&self, kind: Refresh) {
        let state = lock(&self.state);
        if kind == Refresh::Periodic && state.finalized {
            return;
        }
        for (name, bound) in state.bound.iter() {
            set_from_supplier(name, &bound.gauge, &bound.supplier);
        }
    }

    /// Stop periodic refreshes and do one final refresh.
    pub fn finalize(&self) {
        {
            let mut state = lock(&self.state);
            if state.finalized {
                return;
            }
            state.finalized = true;
            if let Some(task) = state.task.take() {
                task.cancel();
            }
        }
        tracing::debug!("Final metrics refresh of stage {}", self.stage);
        self.refresh(Refresh::Final);
    }

    /// Drop every supplier bound by the current logic instance.
    ///
    /// Gauges keep their last value until a new instance rebinds
    /// them.
    pub fn unbind_logic_gauges(&self) {
        let mut state = lock(&self.state);
        let unbound = std::mem::take(&mut state.bound);
        if !unbound.is_empty() {
            tracing::debug!(
                "Unbound {} metric suppliers of stage {}",
                unbound.len(),
                self.stage
            );
        }
    }

    /// Stop periodic refreshes without a final refresh.
    pub fn shutdown(&self) {
        if let Some(task) = lock(&self.state).task.take() {
            task.cancel();
        }
    }

    /// Current value of a gauge.
    pub fn value(&self, name: &str) -> Option<i64> {
        lock(&self.state).gauges.get(name).map(IntGauge::get)
    }

    /// Names of all gauges registered by user logic.
    pub fn custom_metric_names(&self) -> Vec<String> {
        let state = lock(&self.state);
        state
            .gauges
            .keys()
            .filter(|name| !state.builtin.contains(*name))
            .cloned()
            .collect()
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.state).task.is_some()
    }
}

fn set_from_supplier(name: &str, gauge: &IntGauge, supplier: &GaugeSupplier) {
    match catch_unwind(AssertUnwindSafe(supplier)) {
        Ok(value) => gauge.set(value),
        Err(_) => tracing::error!("Supplier of metric {name} panicked; keeping last value"),
    }
}
