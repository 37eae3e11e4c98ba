use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
    time::Duration,
};

use chrono::{DateTime, Local};
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    countdown::{Countdown, CountdownOutcome, DEFAULT_TICK, WaitMonitor, WaitReason, format_hms},
    device::{DevicePattern, ScanDevice},
    error::RunError,
    persist::{ImageMetadata, ImageSink},
    power::PowerController,
    run_data::RunData,
};

/// time the scanner firmware gets to boot before it is looked for
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
/// time the scanner gets to park its head before it is switched off
pub const DEFAULT_SETTLE_PERIOD: Duration = Duration::from_secs(30);
/// power-cycles attempted when the scanner does not show up
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// what to do when a capture fails on a scanner that was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureFailurePolicy {
    /// end the run
    #[default]
    Fatal,
    /// power-cycle and try again, drawing on the device retry budget
    PowerCycle,
}

/// tuning of a scanning run that does not come from the settings file
#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub pattern: DevicePattern,
    pub grace_period: Duration,
    pub settle_period: Duration,
    pub max_retries: u32,
    pub capture_failure: CaptureFailurePolicy,
    /// countdown display cadence
    pub tick: Duration,
}

impl CycleOptions {
    pub fn new(pattern: DevicePattern) -> Self {
        CycleOptions {
            pattern,
            grace_period: DEFAULT_GRACE_PERIOD,
            settle_period: DEFAULT_SETTLE_PERIOD,
            max_retries: DEFAULT_MAX_RETRIES,
            capture_failure: CaptureFailurePolicy::default(),
            tick: DEFAULT_TICK,
        }
    }
}

/// where the orchestrator is within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    PoweringOn,
    AwaitingDeviceReady,
    Scanning,
    PoweringOff,
    WaitingInterval,
    Done,
    Aborted,
    Failed,
}

impl Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Idle => "idle",
            CycleState::PoweringOn => "powering on",
            CycleState::AwaitingDeviceReady => "awaiting device",
            CycleState::Scanning => "scanning",
            CycleState::PoweringOff => "powering off",
            CycleState::WaitingInterval => "waiting for next cycle",
            CycleState::Done => "done",
            CycleState::Aborted => "aborted",
            CycleState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// how a run that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// every cycle ran
    Completed,
    /// the user stopped the run
    Aborted,
}

/// drives power, scanner and image sink through the configured cycles
///
/// Only one device operation and one power operation are ever in flight: every
/// call below blocks until the collaborator returns.
pub struct Orchestrator<'a, D: ScanDevice> {
    power: &'a mut dyn PowerController,
    device: &'a mut D,
    sink: &'a mut dyn ImageSink,
    clock: &'a dyn Clock,
    monitor: &'a mut dyn WaitMonitor,
    options: CycleOptions,
    state: CycleState,
    outlet: u8,
    /// set from the moment power-on is requested until power-off succeeds
    powered: bool,
}

impl<'a, D: ScanDevice> Orchestrator<'a, D> {
    pub fn new(
        power: &'a mut dyn PowerController,
        device: &'a mut D,
        sink: &'a mut dyn ImageSink,
        clock: &'a dyn Clock,
        monitor: &'a mut dyn WaitMonitor,
        options: CycleOptions,
    ) -> Self {
        Orchestrator {
            power,
            device,
            sink,
            clock,
            monitor,
            options,
            state: CycleState::Idle,
            outlet: 0,
            powered: false,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// run every cycle of `run`, finalizing it whatever happens
    ///
    /// Aborts and fatal errors are written into the run log before returning,
    /// and a scanner left powered by an interrupted cycle is switched off.
    pub fn run(&mut self, run: &mut RunData) -> Result<RunOutcome, RunError> {
        self.outlet = run.settings().power.outlet;
        let result = self.drive(run);
        let (state, successful) = match &result {
            Ok(RunOutcome::Completed) => (CycleState::Done, true),
            Ok(RunOutcome::Aborted) => (CycleState::Aborted, false),
            Err(err) => {
                error!("run {} failed: {}", run.uid(), error_chain(err));
                run.record(self.clock.now(), format!("Failed: {}", error_chain(err)));
                (CycleState::Failed, false)
            }
        };
        if state != CycleState::Done && self.powered {
            self.enter(CycleState::PoweringOff);
            if let Err(err) = self.switch_off(run) {
                warn!("cleanup power-off failed: {:#}", err);
                run.record(
                    self.clock.now(),
                    format!("Cleanup power-off of outlet {} failed: {:#}", self.outlet, err),
                );
            }
        }
        self.enter(state);
        if state == CycleState::Done {
            run.record(
                self.clock.now(),
                format!("Run completed: {} scan(s)", run.scans_completed()),
            );
        }
        run.finalize(self.clock.now(), successful)
            .map_err(RunError::Bookkeeping)?;
        result
    }

    fn drive(&mut self, run: &mut RunData) -> Result<RunOutcome, RunError> {
        let settings = run.run_settings().clone();
        info!(
            "starting run {}: {} scan(s) every {} minute(s)",
            run.uid(),
            settings.nscans,
            settings.interval
        );
        run.record(
            self.clock.now(),
            format!(
                "Run started: {} cycle(s), {} minute interval, {} minute delay",
                settings.nscans, settings.interval, settings.delay
            ),
        );
        if settings.nscans == 0 {
            return Ok(RunOutcome::Completed);
        }

        if settings.delay > 0 {
            let delay = minutes(settings.delay);
            run.record(
                self.clock.now(),
                format!("Waiting {} before first cycle", format_hms(delay)),
            );
            if self.wait(WaitReason::InitialDelay, delay) == CountdownOutcome::Aborted {
                run.record(self.clock.now(), "Aborted: user cancelled during initial delay");
                return Ok(RunOutcome::Aborted);
            }
        }

        for cycle in 1..=settings.nscans {
            info!("cycle {} of {}", cycle, settings.nscans);
            run.record(
                self.clock.now(),
                format!("Cycle {} of {}", cycle, settings.nscans),
            );
            if self.cycle(run, cycle)? == RunOutcome::Aborted {
                return Ok(RunOutcome::Aborted);
            }

            if cycle < settings.nscans {
                self.enter(CycleState::WaitingInterval);
                let interval = minutes(settings.interval);
                run.record(
                    self.clock.now(),
                    format!("Waiting {} until cycle {}", format_hms(interval), cycle + 1),
                );
                let reason = WaitReason::Interval {
                    completed: cycle,
                    total: settings.nscans,
                };
                if self.wait(reason, interval) == CountdownOutcome::Aborted {
                    run.record(
                        self.clock.now(),
                        format!("Aborted: user cancelled after scan {}", run.scans_completed()),
                    );
                    return Ok(RunOutcome::Aborted);
                }
            }
        }
        Ok(RunOutcome::Completed)
    }

    /// one power-on, detect, scan, power-off sequence
    fn cycle(&mut self, run: &mut RunData, cycle: u32) -> Result<RunOutcome, RunError> {
        let mut retries = 0;
        loop {
            let device = match self.bring_up(run, &mut retries)? {
                Some(device) => device,
                None => return Ok(RunOutcome::Aborted),
            };
            self.enter(CycleState::Scanning);
            match self.scan(run, cycle, &device) {
                Ok(()) => break,
                Err(err @ RunError::Capture { .. })
                    if self.options.capture_failure == CaptureFailurePolicy::PowerCycle
                        && retries < self.options.max_retries =>
                {
                    retries += 1;
                    warn!("{}, resetting power", error_chain(&err));
                    run.record(
                        self.clock.now(),
                        format!(
                            "{}, resetting power (retry {} of {})",
                            error_chain(&err),
                            retries,
                            self.options.max_retries
                        ),
                    );
                    self.enter(CycleState::PoweringOff);
                    self.switch_off_tolerant(run);
                }
                Err(err) => return Err(err),
            }
        }

        // an interrupt that arrived during the capture is honoured here
        if self.monitor.abort_requested()
            || (!self.options.settle_period.is_zero()
                && self.wait(WaitReason::DeviceSettle, self.options.settle_period)
                    == CountdownOutcome::Aborted)
        {
            run.record(
                self.clock.now(),
                format!("Aborted: user cancelled after scan {}", run.scans_completed()),
            );
            return Ok(RunOutcome::Aborted);
        }

        self.enter(CycleState::PoweringOff);
        self.switch_off_tolerant(run);
        Ok(RunOutcome::Completed)
    }

    /// power the scanner and wait for it to enumerate, power-cycling as needed
    ///
    /// Returns `None` when the user aborts.
    fn bring_up(&mut self, run: &mut RunData, retries: &mut u32) -> Result<Option<String>, RunError> {
        loop {
            if self.monitor.abort_requested() {
                run.record(self.clock.now(), "Aborted: user cancelled before power-on");
                return Ok(None);
            }
            let attempt = *retries + 1;
            self.enter(CycleState::PoweringOn);
            self.switch_on(run)?;

            self.enter(CycleState::AwaitingDeviceReady);
            if self.wait(WaitReason::DeviceBoot { attempt }, self.options.grace_period)
                == CountdownOutcome::Aborted
            {
                run.record(
                    self.clock.now(),
                    "Aborted: user cancelled while waiting for scanner to boot",
                );
                return Ok(None);
            }

            let devices = match self.device.list_devices(&self.options.pattern) {
                Ok(devices) => devices,
                Err(err) => {
                    // a wedged driver is handled like a missing scanner
                    warn!("device enumeration failed: {:#}", err);
                    run.record(
                        self.clock.now(),
                        format!("Device enumeration failed: {:#}", err),
                    );
                    Vec::new()
                }
            };
            if let Some(device) = devices.into_iter().next() {
                info!("found scanner {}", device);
                run.record(self.clock.now(), format!("Found scanner {}", device));
                if self.monitor.abort_requested() {
                    run.record(self.clock.now(), "Aborted: user cancelled before scanning");
                    return Ok(None);
                }
                return Ok(Some(device));
            }

            if *retries >= self.options.max_retries {
                run.record(
                    self.clock.now(),
                    format!(
                        "No scanner matching '{}' found. Max retries reached.",
                        self.options.pattern.as_str()
                    ),
                );
                return Err(RunError::DeviceNotFound {
                    pattern: self.options.pattern.as_str().to_string(),
                    attempts: attempt,
                });
            }
            *retries += 1;
            warn!(
                "no scanner matching '{}' found, resetting power",
                self.options.pattern.as_str()
            );
            run.record(
                self.clock.now(),
                format!(
                    "No scanner matching '{}' found, resetting power (retry {} of {})",
                    self.options.pattern.as_str(),
                    *retries,
                    self.options.max_retries
                ),
            );
            self.enter(CycleState::PoweringOff);
            self.switch_off_tolerant(run);
        }
    }

    /// capture one image from `device` and persist it
    fn scan(&mut self, run: &mut RunData, cycle: u32, device: &str) -> Result<(), RunError> {
        let mut handle = self
            .device
            .open(device)
            .map_err(|source| RunError::Driver {
                action: "open the scanner",
                source,
            })?;
        if let Err(source) = self.device.configure(&mut handle, &run.settings().scanner) {
            self.close(run, handle);
            return Err(RunError::Driver {
                action: "apply scanner settings",
                source,
            });
        }

        let at = self.scan_time(run);
        run.record(at, format!("Scanning cycle {} on {}", cycle, device));
        let captured = self.device.capture(&mut handle);
        self.close(run, handle);
        let image = captured.map_err(|source| RunError::Capture {
            device: device.to_string(),
            source,
        })?;

        let stem = run.scan_fname(cycle, at);
        let metadata = ImageMetadata {
            run_uid: run.uid().to_string(),
            run_date: run.t_start().unwrap_or(at),
            cycle,
            captured_at: at,
            device: device.to_string(),
        };
        let path = self
            .sink
            .save(&image, &stem, &metadata)
            .map_err(|source| RunError::Persist {
                path: PathBuf::from(&stem),
                source,
            })?;
        let completed = run.record_scan(at).map_err(RunError::Bookkeeping)?;
        info!("scan {} saved as {}", completed, path.display());
        run.record(
            self.clock.now(),
            format!("Scan {} saved as {}", completed, path.display()),
        );
        Ok(())
    }

    /// the capture timestamp, never earlier than the previous scan
    ///
    /// A wall clock stepped back (NTP, DST on a naive clock) would otherwise
    /// leave an image on disk that the run cannot count.
    fn scan_time(&self, run: &mut RunData) -> DateTime<Local> {
        let now = self.clock.now();
        match run.t_last_scan() {
            Some(last) if now < last => {
                warn!("clock went back from {} to {}, keeping scan order", last, now);
                run.record(
                    now,
                    format!(
                        "Warning: clock went back by {}, scan stamped with the previous scan time",
                        format_hms((last - now).to_std().unwrap_or_default())
                    ),
                );
                last
            }
            _ => now,
        }
    }

    fn close(&mut self, run: &mut RunData, handle: D::Handle) {
        if let Err(err) = self.device.close(handle) {
            warn!("failed to close scanner: {:#}", err);
            run.record(self.clock.now(), format!("Failed to close scanner: {:#}", err));
        }
    }

    fn switch_on(&mut self, run: &mut RunData) -> Result<(), RunError> {
        let outlet = self.outlet;
        // the outlet state is unknown once the command has gone out
        self.powered = true;
        self.power
            .power_on(outlet)
            .map_err(|source| RunError::PowerControl {
                action: "power on",
                outlet,
                source,
            })?;
        run.record(self.clock.now(), format!("Power on outlet {}", outlet));
        Ok(())
    }

    fn switch_off(&mut self, run: &mut RunData) -> anyhow::Result<()> {
        self.power.power_off(self.outlet)?;
        self.powered = false;
        run.record(self.clock.now(), format!("Power off outlet {}", self.outlet));
        Ok(())
    }

    /// power off, logging a failure instead of ending the run
    ///
    /// The next power-on reasserts the outlet state.
    fn switch_off_tolerant(&mut self, run: &mut RunData) {
        if let Err(err) = self.switch_off(run) {
            warn!("power off of outlet {} failed: {:#}", self.outlet, err);
            run.record(
                self.clock.now(),
                format!("Warning: power off of outlet {} failed: {:#}", self.outlet, err),
            );
        }
    }

    fn wait(&mut self, reason: WaitReason, total: Duration) -> CountdownOutcome {
        if total.is_zero() {
            return CountdownOutcome::Completed;
        }
        Countdown::new(total, self.options.tick).wait(self.clock, reason, &mut *self.monitor)
    }

    fn enter(&mut self, next: CycleState) {
        debug!("{} -> {}", self.state, next);
        self.state = next;
    }
}

fn minutes(m: u32) -> Duration {
    Duration::from_secs(u64::from(m) * 60)
}

/// `error: cause: cause` rendering of an error and its sources
fn error_chain(err: &dyn Error) -> String {
    let mut s = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        s.push_str(": ");
        s.push_str(&cause.to_string());
        source = cause.source();
    }
    s
}
