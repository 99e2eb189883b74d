//! Where windows get the current time from.
//!
//! Time eviction compares each element's insertion time against
//! [`Clock::now`]. Production stages use [`SystemClock`]; tests drive
//! a [`TestingClock`] by hand so they never sleep.

use chrono::DateTime;
use chrono::Utc;

pub mod system_clock;
pub mod testing_clock;

pub use system_clock::SystemClock;
pub use testing_clock::TestingClock;

pub trait Clock: Send {
    /// Return the current time.
    ///
    /// Must never go backwards between two calls.
    fn now(&self) -> DateTime<Utc>;
}

impl<C> Clock for Box<C>
where
    C: Clock + ?Sized,
{
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
