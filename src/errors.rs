//! Error types for functional stages.
//!
//! Every failure a stage can hit is surfaced to the immediate caller
//! as a [`StageError`]. Nothing in this crate retries: user logic
//! side effects are not assumed to be idempotent.

use std::any::Any;
use std::panic::Location;

use thiserror::Error;

/// Error type returned from user logic.
pub type LogicError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned from user logic.
pub type LogicResult<T> = Result<T, LogicError>;

pub type StageResult<T> = Result<T, StageError>;

#[derive(Debug, Error)]
pub enum StageError {
    /// Bad stage parameters or an invalid combination of logic and
    /// fault tolerance settings. Fatal at initialization.
    #[error("configuration error: {0}")]
    Config(String),
    /// User logic, a key function, or a value mapping failed.
    #[error("logic error: {0}")]
    Logic(String),
    /// A checkpoint could not be captured or restored.
    #[error("recovery error: {0}")]
    Recovery(String),
    /// A previous fatal error terminated the stage.
    #[error("stage failed: {0}")]
    Failed(String),
    #[error("{0} is shut down")]
    Shutdown(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StageError {
    #[track_caller]
    pub fn config(msg: impl AsRef<str>) -> Self {
        Self::Config(prepend_caller(Location::caller(), msg.as_ref()))
    }

    #[track_caller]
    pub fn logic(msg: impl AsRef<str>) -> Self {
        Self::Logic(prepend_caller(Location::caller(), msg.as_ref()))
    }

    #[track_caller]
    pub fn recovery(msg: impl AsRef<str>) -> Self {
        Self::Recovery(prepend_caller(Location::caller(), msg.as_ref()))
    }

    /// Whether this error should terminate the stage.
    ///
    /// Configuration errors are only raised at initialization and
    /// recovery errors abort the recovery attempt, which the host
    /// escalates itself.
    pub(crate) fn is_fatal(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::Recovery(_) | Self::Shutdown(_))
    }
}

/// Add context to an error while keeping its kind.
pub(crate) trait StageException<T> {
    fn into_stage_result(self) -> StageResult<T>;

    /// Wrap the error with a message and the caller location.
    ///
    /// Example:
    ///     window.restore(entries).reraise("error restoring window")?;
    #[track_caller]
    fn reraise(self, msg: &str) -> StageResult<T>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_stage_result().map_err(|err| {
            let msg = format!("{}\nCaused by => {err}", prepend_caller(caller, msg));
            match err {
                StageError::Config(_) | StageError::Io(_) | StageError::Prometheus(_) => {
                    StageError::Config(msg)
                }
                StageError::Recovery(_)
                | StageError::Json(_)
                | StageError::Sqlite(_)
                | StageError::Migration(_) => StageError::Recovery(msg),
                StageError::Failed(_) => StageError::Failed(msg),
                StageError::Shutdown(what) => StageError::Shutdown(what),
                _ => StageError::Logic(msg),
            }
        })
    }
}

impl<T, E> StageException<T> for Result<T, E>
where
    E: Into<StageError>,
{
    fn into_stage_result(self) -> StageResult<T> {
        self.map_err(Into::into)
    }
}

/// Convert an error raised by user logic into a stage error.
#[track_caller]
pub(crate) fn logic_err(what: &str, err: LogicError) -> StageError {
    StageError::Logic(prepend_caller(Location::caller(), &format!("{what}: {err}")))
}

/// Build a logic error out of a caught panic payload.
pub(crate) fn panic_err(what: &str, payload: Box<dyn Any + Send>) -> StageError {
    let msg = if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    };
    StageError::Logic(format!("{what} panicked: {msg}"))
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

#[test]
fn config_error_carries_location() {
    let err = StageError::config("Missing key getter function");
    let msg = err.to_string();
    assert!(msg.starts_with("configuration error: (src/errors.rs:"));
    assert!(msg.ends_with("Missing key getter function"));
    assert!(!err.is_fatal());
}

#[test]
fn reraise_keeps_kind() {
    let res: StageResult<()> = Err(StageError::recovery("bad bytes"));
    let err = res.reraise("error resetting logic").unwrap_err();
    assert!(matches!(err, StageError::Recovery(_)));
    assert!(err.to_string().contains("Caused by => recovery error"));

    let res: Result<(), serde_json::Error> = serde_json::from_str::<u64>("x").map(|_| ());
    let err = res.reraise("error decoding snapshot").unwrap_err();
    assert!(matches!(err, StageError::Recovery(_)));
}

#[test]
fn panic_payloads_become_logic_errors() {
    let payload = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
    let err = panic_err("map logic", payload);
    assert!(matches!(err, StageError::Logic(_)));
    assert_eq!(err.to_string(), "logic error: map logic panicked: boom 1");
    assert!(err.is_fatal());
}

#[test]
fn tname_prefixes_each_line() {
    let msg = std::thread::Builder::new()
        .name("stage-worker".to_string())
        .spawn(|| prepend_tname("first\nsecond".to_string()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(msg, "<stage-worker> first\n<stage-worker> second\n");
}
