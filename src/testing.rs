//! Helpers for testing stages without a host runtime.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use prometheus::Registry;

use crate::common::lock;
use crate::config::ConfigContext;
use crate::errors::StageResult;
use crate::logic::FunctionContext;
use crate::mapping::Tuple;
use crate::metrics::MetricsReporter;
use crate::recovery::StepId;
use crate::stage::Downstream;
use crate::timer::Timer;

/// Something a stage sent downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum Emitted {
    Tuple { port: usize, tuple: Tuple },
    EndOfStream { port: usize },
}

/// A [`Downstream`] that records everything it is sent.
#[derive(Debug, Default)]
pub struct CaptureDownstream {
    emitted: Mutex<Vec<Emitted>>,
}

impl CaptureDownstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn emitted(&self) -> Vec<Emitted> {
        lock(&self.emitted).clone()
    }

    /// Tuples submitted to `port`, in order.
    pub fn tuples(&self, port: usize) -> Vec<Tuple> {
        lock(&self.emitted)
            .iter()
            .filter_map(|emitted| match emitted {
                Emitted::Tuple { port: p, tuple } if *p == port => Some(tuple.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn end_of_stream_count(&self, port: usize) -> usize {
        lock(&self.emitted)
            .iter()
            .filter(|emitted| matches!(emitted, Emitted::EndOfStream { port: p } if *p == port))
            .count()
    }

    /// Poll until at least `count` things were emitted. Returns
    /// whether that happened before `timeout`.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if lock(&self.emitted).len() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Downstream for CaptureDownstream {
    fn submit(&self, port: usize, tuple: Tuple) -> StageResult<()> {
        lock(&self.emitted).push(Emitted::Tuple { port, tuple });
        Ok(())
    }

    fn propagate_end_of_stream(&self, port: usize) -> StageResult<()> {
        lock(&self.emitted).push(Emitted::EndOfStream { port });
        Ok(())
    }
}

/// A context for logic outside of a stage, with its own registry and
/// timer.
pub fn function_context(stage: &str) -> StageResult<FunctionContext> {
    let timer = Arc::new(Timer::new(stage)?);
    let metrics = Arc::new(MetricsReporter::new(
        StepId::from(stage),
        Registry::new(),
        timer,
        Duration::from_secs(1),
    ));
    Ok(FunctionContext::new(
        StepId::from(stage),
        0,
        1,
        Arc::new(ConfigContext::default()),
        metrics,
    ))
}
