use std::{
    fmt::{self, Display},
    iter::FusedIterator,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Local};
use tracing::trace;

use crate::clock::Clock;

/// display cadence used unless a caller asks for something else
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// why a countdown is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// waiting to begin the first cycle
    InitialDelay,
    /// letting the scanner firmware boot after power-on
    DeviceBoot { attempt: u32 },
    /// letting the scanner park its head before power-off
    DeviceSettle,
    /// between two cycles
    Interval { completed: u32, total: u32 },
}

impl Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitReason::InitialDelay => write!(f, "Time until first scan"),
            WaitReason::DeviceBoot { attempt } => {
                write!(f, "Waiting for scanner to boot (attempt {})", attempt)
            }
            WaitReason::DeviceSettle => write!(f, "Waiting for scanner to settle"),
            WaitReason::Interval { completed, total } => {
                write!(f, "Scan {} of {} done. Next scan in", completed, total)
            }
        }
    }
}

/// how a countdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownOutcome {
    /// the full duration elapsed
    Completed,
    /// the abort check fired before the duration elapsed
    Aborted,
}

/// observer of a running countdown, also the source of abort requests
pub trait WaitMonitor {
    fn wait_started(&mut self, _reason: &WaitReason, _total: Duration) {}
    /// called once per tick with the time still to wait
    fn remaining(&mut self, reason: &WaitReason, remaining: Duration);
    fn wait_finished(&mut self, _reason: &WaitReason, _outcome: CountdownOutcome) {}
    /// polled at every tick, before power-on, before and after each capture
    fn abort_requested(&mut self) -> bool;
}

/// stop request shared between the run and whoever can interrupt it
///
/// Raised from the interrupt handler or the keyboard, never lowered again.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// monitor for runs without anyone watching the terminal
///
/// Only aborts when its flag is raised, which `main` wires to SIGINT.
#[derive(Debug, Default)]
pub struct Unattended {
    abort: AbortFlag,
}

impl Unattended {
    pub fn new(abort: AbortFlag) -> Self {
        Unattended { abort }
    }
}

impl WaitMonitor for Unattended {
    fn remaining(&mut self, reason: &WaitReason, remaining: Duration) {
        trace!("{}: {}", reason, format_hms(remaining));
    }

    fn abort_requested(&mut self) -> bool {
        self.abort.is_raised()
    }
}

/// a single abortable wait
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use unscanny::clock::SystemClock;
/// use unscanny::countdown::{Countdown, DEFAULT_TICK, format_hms};
///
/// for remaining in Countdown::new(Duration::from_secs(5), DEFAULT_TICK).ticks(&SystemClock) {
///     println!("time remaining: {}", format_hms(remaining));
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Countdown {
    total: Duration,
    tick: Duration,
}

impl Countdown {
    /// a zero `tick` falls back to [`DEFAULT_TICK`]
    pub fn new(total: Duration, tick: Duration) -> Self {
        let tick = if tick.is_zero() { DEFAULT_TICK } else { tick };
        Countdown { total, tick }
    }

    /// lazily yield the remaining time, sleeping on `clock` between values
    ///
    /// The first value is the full duration and the last one is exactly zero.
    pub fn ticks(self, clock: &dyn Clock) -> Ticks<'_> {
        let now = clock.now();
        let deadline = chrono::TimeDelta::from_std(self.total)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(now);
        Ticks {
            clock,
            deadline,
            tick: self.tick,
            remaining: self.total,
            started: false,
            done: false,
        }
    }

    /// run the countdown to the end or until `monitor` asks to abort
    pub fn wait(
        self,
        clock: &dyn Clock,
        reason: WaitReason,
        monitor: &mut dyn WaitMonitor,
    ) -> CountdownOutcome {
        monitor.wait_started(&reason, self.total);
        let mut outcome = CountdownOutcome::Completed;
        for remaining in self.ticks(clock) {
            monitor.remaining(&reason, remaining);
            if monitor.abort_requested() {
                trace!("{} aborted with {} left", reason, format_hms(remaining));
                outcome = CountdownOutcome::Aborted;
                break;
            }
        }
        monitor.wait_finished(&reason, outcome);
        outcome
    }
}

/// remaining-time sequence of a [`Countdown`]
pub struct Ticks<'c> {
    clock: &'c dyn Clock,
    deadline: DateTime<Local>,
    tick: Duration,
    remaining: Duration,
    started: bool,
    done: bool,
}

impl Iterator for Ticks<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.done {
            return None;
        }
        if self.started {
            self.clock.sleep(self.tick.min(self.remaining));
            // measure against the deadline so slow ticks do not accumulate drift
            self.remaining = (self.deadline - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
        }
        self.started = true;
        if self.remaining.is_zero() {
            self.done = true;
        }
        Some(self.remaining)
    }
}

impl FusedIterator for Ticks<'_> {}

/// render a duration as HH:MM:SS, rounding partial seconds up
pub fn format_hms(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs += 1;
    }
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
