use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local};
use tracing::debug;
use uuid::Uuid;

use crate::settings::{RunSettings, Settings};

const REPORT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// one line of the run narrative
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub at: DateTime<Local>,
    pub message: String,
}

/// progress record of a single run, owned by whoever drives the cycles
#[derive(Debug, Clone)]
pub struct RunData {
    /// short unique id, fixed at construction
    uid: String,
    settings: Settings,
    created: DateTime<Local>,
    scans_completed: u32,
    /// time of the first successful scan
    t_start: Option<DateTime<Local>>,
    t_last_scan: Option<DateTime<Local>>,
    t_end: Option<DateTime<Local>>,
    successful: bool,
    finalized: bool,
    log: Vec<LogEntry>,
}

impl RunData {
    pub fn new(settings: Settings, created: DateTime<Local>) -> Self {
        Self::with_uid(settings, created, generate_uid())
    }

    /// like [`RunData::new`] but with a caller supplied id
    pub fn with_uid(settings: Settings, created: DateTime<Local>, uid: impl Into<String>) -> Self {
        RunData {
            uid: uid.into(),
            settings,
            created,
            scans_completed: 0,
            t_start: None,
            t_last_scan: None,
            t_end: None,
            successful: false,
            finalized: false,
            log: Vec::new(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn run_settings(&self) -> &RunSettings {
        &self.settings.run
    }

    pub fn scans_completed(&self) -> u32 {
        self.scans_completed
    }

    pub fn t_start(&self) -> Option<DateTime<Local>> {
        self.t_start
    }

    pub fn t_last_scan(&self) -> Option<DateTime<Local>> {
        self.t_last_scan
    }

    pub fn t_end(&self) -> Option<DateTime<Local>> {
        self.t_end
    }

    pub fn successful(&self) -> bool {
        self.successful
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.log
    }

    /// append to the run narrative
    pub fn record(&mut self, at: DateTime<Local>, message: impl Into<String>) {
        let message = message.into();
        debug!("run {}: {}", self.uid, message);
        self.log.push(LogEntry { at, message });
    }

    /// count a successful capture taken at `at`, returns the new total
    pub fn record_scan(&mut self, at: DateTime<Local>) -> Result<u32> {
        if self.finalized {
            return Err(anyhow!("run {} is already finalized", self.uid));
        }
        if self.scans_completed >= self.settings.run.nscans {
            return Err(anyhow!(
                "run {} already has all {} scans",
                self.uid,
                self.settings.run.nscans
            ));
        }
        if let Some(last) = self.t_last_scan {
            if at < last {
                return Err(anyhow!(
                    "scan time {} is earlier than the previous scan {}",
                    at.format(REPORT_TIME_FORMAT),
                    last.format(REPORT_TIME_FORMAT)
                ));
            }
        }
        if self.t_start.is_none() {
            self.t_start = Some(at);
        }
        self.t_last_scan = Some(at);
        self.scans_completed += 1;
        Ok(self.scans_completed)
    }

    /// stamp the end of the run, only allowed once
    pub fn finalize(&mut self, at: DateTime<Local>, successful: bool) -> Result<()> {
        if self.finalized {
            return Err(anyhow!("run {} is already finalized", self.uid));
        }
        self.t_end = Some(at);
        self.successful = successful;
        self.finalized = true;
        Ok(())
    }

    /// `<date>-<user>-<experiment>-<uid>`, dated by the first scan
    pub fn base_fname(&self) -> String {
        self.fname_for(self.t_start.unwrap_or(self.created))
    }

    fn fname_for(&self, date: DateTime<Local>) -> String {
        format!(
            "{}-{}-{}-{}",
            date.format("%Y-%m-%d"),
            self.settings.run.user,
            self.settings.run.experiment,
            self.uid
        )
    }

    /// file stem for the image of `cycle` captured at `at`, without extension
    pub fn scan_fname(&self, cycle: u32, at: DateTime<Local>) -> String {
        // the first scan is the one that fixes the run date
        format!(
            "{}-{:04}-{}",
            self.fname_for(self.t_start.unwrap_or(at)),
            cycle,
            at.format("%Y%m%dT%H%M%S")
        )
    }

    pub fn report_fname(&self) -> String {
        format!("{}.log", self.base_fname())
    }

    pub fn generate_report(&self) -> String {
        let stamp = |t: Option<DateTime<Local>>| {
            t.map(|t| t.format(REPORT_TIME_FORMAT).to_string())
                .unwrap_or_default()
        };
        let mut s = String::from("RUN REPORT\n\n");
        // writing into a String cannot fail
        let _ = writeln!(s, "UID: {}\n", self.uid);
        s.push_str(&self.settings.summary());
        let _ = writeln!(s);
        let _ = writeln!(s, "Start time: {}", stamp(self.t_start));
        let _ = writeln!(s, "Last scan: {}", stamp(self.t_last_scan));
        let _ = writeln!(s, "End time: {}\n", stamp(self.t_end));
        let _ = writeln!(s, "Completed scans: {}", self.scans_completed);
        let _ = writeln!(s, "Run successful: {}\n", self.successful);
        s.push_str("Log:\n");
        for entry in &self.log {
            let _ = writeln!(s, "\t[{}] {}", entry.at.format(LOG_TIME_FORMAT), entry.message);
        }
        s
    }

    /// write the report into `dir`, returns the path written
    pub fn write_report(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.report_fname());
        fs::write(&path, self.generate_report())
            .with_context(|| format!("failed to write run report {}", path.display()))?;
        Ok(path)
    }
}

fn generate_uid() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    uuid[..8].to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;
    use crate::clock::{Clock, manual::ManualClock};

    fn settings(nscans: u32) -> Settings {
        let mut settings = Settings::template();
        settings.run.user = String::from("smith");
        settings.run.experiment = String::from("roots");
        settings.run.nscans = nscans;
        settings
    }

    #[test]
    fn test_uid_is_short_hex() {
        let clock = ManualClock::new();
        let a = RunData::new(settings(1), clock.now());
        let b = RunData::new(settings(1), clock.now());
        assert_eq!(a.uid().len(), 8);
        assert!(a.uid().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn test_record_scan_updates_progress() -> Result<()> {
        let clock = ManualClock::new();
        let mut run = RunData::with_uid(settings(2), clock.now(), "abcd1234");
        clock.advance(Duration::from_secs(30));
        let first = clock.now();
        assert_eq!(run.record_scan(first)?, 1);
        clock.advance(Duration::from_secs(600));
        let second = clock.now();
        assert_eq!(run.record_scan(second)?, 2);
        assert_eq!(run.t_start(), Some(first));
        assert_eq!(run.t_last_scan(), Some(second));
        assert_eq!(run.scans_completed(), 2);
        // no more than nscans
        assert!(run.record_scan(clock.now()).is_err());
        assert_eq!(run.scans_completed(), 2);
        Ok(())
    }

    #[test]
    fn test_scan_times_must_not_go_backwards() -> Result<()> {
        let clock = ManualClock::new();
        let mut run = RunData::with_uid(settings(3), clock.now(), "abcd1234");
        let t = clock.now() + TimeDelta::minutes(10);
        run.record_scan(t)?;
        assert!(run.record_scan(t - TimeDelta::minutes(1)).is_err());
        assert_eq!(run.t_start(), Some(t));
        Ok(())
    }

    #[test]
    fn test_finalize_once() -> Result<()> {
        let clock = ManualClock::new();
        let mut run = RunData::with_uid(settings(1), clock.now(), "abcd1234");
        run.finalize(clock.now(), true)?;
        assert!(run.successful());
        assert!(run.finalize(clock.now(), false).is_err());
        assert!(run.successful());
        assert!(run.record_scan(clock.now()).is_err());
        Ok(())
    }

    #[test]
    fn test_file_names() -> Result<()> {
        let clock = ManualClock::new();
        let mut run = RunData::with_uid(settings(2), clock.now(), "abcd1234");
        assert_eq!(run.base_fname(), "2024-05-01-smith-roots-abcd1234");
        let at = clock.now() + TimeDelta::seconds(95);
        assert_eq!(
            run.scan_fname(1, at),
            "2024-05-01-smith-roots-abcd1234-0001-20240501T090135"
        );
        run.record_scan(at)?;
        assert_eq!(run.report_fname(), "2024-05-01-smith-roots-abcd1234.log");
        Ok(())
    }

    #[test]
    fn test_report_contents() -> Result<()> {
        let clock = ManualClock::new();
        let mut run = RunData::with_uid(settings(1), clock.now(), "abcd1234");
        run.record(clock.now(), "power on outlet 1");
        clock.advance(Duration::from_secs(60));
        run.record_scan(clock.now())?;
        run.record(clock.now(), "scan 1 saved");
        run.finalize(clock.now(), true)?;
        let report = run.generate_report();
        assert!(report.starts_with("RUN REPORT\n\nUID: abcd1234\n\nSETTINGS:\n"));
        assert!(report.contains("Start time: 2024-05-01T09:01:00\n"));
        assert!(report.contains("End time: 2024-05-01T09:01:00\n"));
        assert!(report.contains("Completed scans: 1\n"));
        assert!(report.contains("Run successful: true\n"));
        assert!(report.ends_with(
            "Log:\n\t[2024-05-01 09:00:00] power on outlet 1\n\t[2024-05-01 09:01:00] scan 1 saved\n"
        ));
        Ok(())
    }

    #[test]
    fn test_report_is_idempotent() {
        let clock = ManualClock::new();
        let mut run = RunData::with_uid(settings(1), clock.now(), "abcd1234");
        run.record(clock.now(), "Aborted: user cancelled during initial delay");
        assert_eq!(run.generate_report(), run.generate_report());
        assert!(run.generate_report().contains("Start time: \n"));
    }

    #[test]
    fn test_write_report() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let clock = ManualClock::new();
        let run = RunData::with_uid(settings(1), clock.now(), "abcd1234");
        let path = run.write_report(dir.path())?;
        assert_eq!(path, dir.path().join("2024-05-01-smith-roots-abcd1234.log"));
        assert_eq!(fs::read_to_string(path)?, run.generate_report());
        Ok(())
    }
}
