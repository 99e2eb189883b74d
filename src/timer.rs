//! Shared periodic timer of a stage.
//!
//! Metric refreshes, periodic triggers and time eviction sweeps all
//! run as fixed-delay tasks on one tokio runtime per stage. The
//! runtime has a single worker thread, `<stage>-timer`, so tasks
//! never run concurrently with each other. A current-thread runtime
//! would only make progress while someone blocks on it.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;

use crate::errors::StageException;
use crate::errors::StageResult;

pub struct Timer {
    // Optional so it can be shut down in the background on drop,
    // which is also allowed from within one of its own tasks.
    rt: Option<Runtime>,
    handle: Handle,
}

/// Handle to a scheduled periodic task.
///
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct PeriodicTask {
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Stop the task. A run in progress is allowed to finish.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Timer {
    pub fn new(name: &str) -> StageResult<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("{name}-timer"))
            .enable_time()
            .build()
            .reraise(&format!("error starting timer thread of {name}"))?;
        let handle = rt.handle().clone();
        Ok(Self {
            rt: Some(rt),
            handle,
        })
    }

    /// Run `task` every `period`, first after one `period`.
    ///
    /// The delay between two runs is measured from the end of the
    /// previous run, so slow runs push later ones back instead of
    /// bunching up.
    pub fn schedule_with_fixed_delay<F>(&self, period: Duration, task: F) -> PeriodicTask
    where
        F: Fn() + Send + 'static,
    {
        let fut = async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                task();
            }
        };
        PeriodicTask {
            handle: self.handle.spawn(fut),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }
}

#[test]
fn runs_until_cancelled() {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    let timer = Timer::new("test").unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let task = {
        let runs = runs.clone();
        timer.schedule_with_fixed_delay(Duration::from_millis(10), move || {
            runs.fetch_add(1, Ordering::SeqCst);
        })
    };
    std::thread::sleep(Duration::from_millis(100));
    task.cancel();
    std::thread::sleep(Duration::from_millis(20));
    let after_cancel = runs.load(Ordering::SeqCst);
    assert!(after_cancel > 0);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
    assert!(task.is_finished());
}

#[test]
fn tasks_share_one_named_thread() {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::Mutex;

    let timer = Timer::new("shared").unwrap();
    let threads = Arc::new(Mutex::new(HashSet::new()));
    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let threads = threads.clone();
            timer.schedule_with_fixed_delay(Duration::from_millis(5), move || {
                let name = std::thread::current().name().map(str::to_string);
                threads.lock().unwrap().insert(name);
            })
        })
        .collect();
    std::thread::sleep(Duration::from_millis(100));
    for task in tasks {
        task.cancel();
    }
    let threads = threads.lock().unwrap();
    assert_eq!(*threads, HashSet::from([Some("shared-timer".to_string())]));
}
