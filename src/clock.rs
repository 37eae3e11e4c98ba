use std::{thread, time::Duration};

use chrono::{DateTime, Local};

/// source of wall-clock time and blocking waits
///
/// Everything that stamps or waits goes through a clock so that a run can be
/// replayed on virtual time.
pub trait Clock {
    fn now(&self) -> DateTime<Local>;
    fn sleep(&self, duration: Duration);
}

/// the real clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
