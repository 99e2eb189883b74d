use chrono::DateTime;
use chrono::Utc;

use super::Clock;

/// Use the system time to age window elements.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
