use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;

use super::Clock;
use crate::common::lock;

/// Use to simulate system time in tests.
///
/// Clones share the same "now", so a test can keep one handle and
/// give another to a window.
#[derive(Debug, Clone)]
pub struct TestingClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestingClock {
    pub fn new(start_at: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start_at)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = lock(&self.now);
        *now = to;
    }
}

impl Clock for TestingClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

#[test]
fn clones_share_now() {
    let start = DateTime::<Utc>::MIN_UTC;
    let clock = TestingClock::new(start);
    let handle = clock.clone();
    handle.advance(Duration::seconds(5));
    assert_eq!(clock.now(), start + Duration::seconds(5));
}

#[test]
fn set_moves_every_clone() {
    let start = DateTime::<Utc>::MIN_UTC;
    let clock = TestingClock::new(start);
    let handle = clock.clone();
    clock.advance(Duration::seconds(1));
    handle.set(start + Duration::hours(2));
    assert_eq!(clock.now(), start + Duration::hours(2));
}
