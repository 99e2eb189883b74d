//! Decoupling queue.
//!
//! Separates the threads that deliver elements to a stage from the
//! thread that processes them. Input threads [`enqueue`] into a
//! bounded channel and block while it is full. A single worker thread
//! takes entries out in FIFO order and hands them to the stage.
//!
//! End-of-stream markers travel through the same channel, so a marker
//! is only delivered after every element queued before it.
//!
//! Shutdown is the one place data is lost: entries that the worker
//! has not taken out yet are dropped. The element being delivered
//! when shutdown starts is allowed to finish.
//!
//! [`enqueue`]: DecouplingQueue::enqueue

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam::channel::bounded;
use crossbeam::channel::Receiver;
use crossbeam::channel::Select;
use crossbeam::channel::Sender;
use crossbeam::channel::TrySendError;

use crate::common::lock;
use crate::errors::prepend_tname;
use crate::errors::StageError;
use crate::errors::StageResult;
use crate::mapping::Tuple;

/// What the worker hands to the stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Element { port: usize, tuple: Tuple },
    EndOfStream { port: usize },
}

/// Processes what comes out of the queue.
pub type Consumer = Box<dyn Fn(Delivery) -> StageResult<()> + Send>;

enum QueueEntry {
    Element {
        /// Elements from an earlier epoch were discarded.
        epoch: u64,
        port: usize,
        tuple: Tuple,
    },
    EndOfStream {
        port: usize,
    },
    Barrier(Sender<()>),
}

#[derive(Default)]
struct Shared {
    epoch: AtomicU64,
    stopped: AtomicBool,
    failure: Mutex<Option<String>>,
}

pub struct DecouplingQueue {
    name: String,
    tx: Sender<QueueEntry>,
    /// Dropped to tell everyone to stop.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    /// Disconnects when the worker exits.
    done_rx: Receiver<()>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DecouplingQueue {
    pub fn new(name: &str, capacity: usize, consumer: Consumer) -> StageResult<Self> {
        if capacity == 0 {
            return Err(StageError::config("queue capacity must be greater than zero"));
        }
        let (tx, rx) = bounded(capacity);
        let (stop_tx, stop_rx) = bounded(0);
        let (done_tx, done_rx) = bounded(0);
        let shared = Arc::new(Shared::default());

        let worker = {
            let stop_rx = stop_rx.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("{name}-queue"))
                .spawn(move || {
                    let _done = done_tx;
                    work(rx, stop_rx, &shared, consumer);
                })?
        };
        tracing::info!("Started decoupling queue of {name} with capacity {capacity}");

        Ok(Self {
            name: name.to_string(),
            tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            done_rx,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Number of entries waiting for the worker.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Queue an element, blocking while the queue is full.
    pub fn enqueue(&self, port: usize, tuple: Tuple) -> StageResult<()> {
        self.check()?;
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        self.send(QueueEntry::Element { epoch, port, tuple })
    }

    /// Queue an end-of-stream marker behind everything already
    /// queued.
    pub fn end_of_stream(&self, port: usize) -> StageResult<()> {
        self.check()?;
        self.send(QueueEntry::EndOfStream { port })
    }

    /// Block until everything queued before this call was delivered.
    pub fn barrier(&self) -> StageResult<()> {
        self.check()?;
        let (ack_tx, ack_rx) = bounded(1);
        self.send(QueueEntry::Barrier(ack_tx))?;

        let mut sel = Select::new();
        let ack = sel.recv(&ack_rx);
        let stop = sel.recv(&self.stop_rx);
        let done = sel.recv(&self.done_rx);
        let oper = sel.select();
        let res = match oper.index() {
            i if i == ack => oper.recv(&ack_rx).map_err(|_| ()),
            i if i == stop => oper.recv(&self.stop_rx).map_err(|_| ()),
            i if i == done => oper.recv(&self.done_rx).map_err(|_| ()),
            _ => unreachable!(),
        };
        match res {
            Ok(()) => Ok(()),
            Err(()) => Err(self.closed_err()),
        }
    }

    /// Drop every element queued before this call without delivering
    /// it. Markers are still delivered.
    pub fn discard(&self) -> StageResult<()> {
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Discarding queued elements of {} before epoch {epoch}", self.name);
        self.barrier()
    }

    /// Stop the worker.
    ///
    /// Entries not yet taken out of the queue are dropped. Waits for
    /// the entry in flight, unless called from the worker itself.
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        drop(lock(&self.stop_tx).take());
        if let Some(worker) = lock(&self.worker).take() {
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::error!("Queue worker of {} panicked", self.name);
            }
            let dropped = self.tx.len();
            if dropped > 0 {
                tracing::warn!(
                    "Dropped {dropped} queued entries of {} at shutdown",
                    self.name
                );
            }
        }
    }

    fn send(&self, entry: QueueEntry) -> StageResult<()> {
        let entry = match self.tx.try_send(entry) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(entry)) => entry,
            Err(TrySendError::Disconnected(_)) => return Err(self.closed_err()),
        };

        tracing::trace!("Queue of {} is full; blocking", self.name);
        let mut sel = Select::new();
        let send = sel.send(&self.tx);
        let stop = sel.recv(&self.stop_rx);
        let oper = sel.select();
        match oper.index() {
            i if i == send => oper.send(&self.tx, entry).map_err(|_| self.closed_err()),
            i if i == stop => {
                let _ = oper.recv(&self.stop_rx);
                Err(self.closed_err())
            }
            _ => unreachable!(),
        }
    }

    fn check(&self) -> StageResult<()> {
        if let Some(failure) = lock(&self.shared.failure).as_ref() {
            return Err(StageError::Failed(failure.clone()));
        }
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(StageError::Shutdown(format!("queue of {}", self.name)));
        }
        Ok(())
    }

    fn closed_err(&self) -> StageError {
        match self.check() {
            Err(err) => err,
            Ok(()) => StageError::Shutdown(format!("queue of {}", self.name)),
        }
    }
}

impl Drop for DecouplingQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(rx: Receiver<QueueEntry>, stop_rx: Receiver<()>, shared: &Shared, consumer: Consumer) {
    let mut discarded = 0_u64;
    while !shared.stopped.load(Ordering::SeqCst) {
        let mut sel = Select::new();
        let recv = sel.recv(&rx);
        let stop = sel.recv(&stop_rx);
        let oper = sel.select();
        let entry = match oper.index() {
            i if i == recv => match oper.recv(&rx) {
                Ok(entry) => entry,
                Err(_) => break,
            },
            i if i == stop => {
                let _ = oper.recv(&stop_rx);
                break;
            }
            _ => unreachable!(),
        };

        let delivery = match entry {
            QueueEntry::Element { epoch, port, tuple } => {
                if epoch < shared.epoch.load(Ordering::SeqCst) {
                    discarded += 1;
                    continue;
                }
                Delivery::Element { port, tuple }
            }
            QueueEntry::EndOfStream { port } => Delivery::EndOfStream { port },
            QueueEntry::Barrier(ack) => {
                if discarded > 0 {
                    tracing::debug!("Discarded {discarded} queued elements");
                    discarded = 0;
                }
                let _ = ack.send(());
                continue;
            }
        };

        match consumer(delivery) {
            Ok(()) => {}
            Err(StageError::Shutdown(_)) => break,
            Err(err) => {
                tracing::error!("{}", prepend_tname(format!("Queue delivery failed: {err}")));
                *lock(&shared.failure) = Some(err.to_string());
                break;
            }
        }
    }
    tracing::debug!("Queue worker exiting");
}
