use std::{
    io::{Stdout, Write, stdout},
    time::Duration,
};

use crossterm::{
    cursor::MoveToColumn,
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    queue,
    terminal::{self, Clear, ClearType},
};
use anyhow::{Context, Result};
use tracing::warn;

use crate::countdown::{AbortFlag, CountdownOutcome, WaitMonitor, WaitReason, format_hms};

/// key that cancels a run
pub const ABORT_KEY: char = 'Q';

/// the single status line shown while waiting
pub fn status_line(reason: &WaitReason, remaining: Duration) -> String {
    format!("{}: {}", reason, format_hms(remaining))
}

/// is this key press a request to stop the run
pub fn is_abort_key(key: &KeyEvent) -> bool {
    if key.kind != KeyEventKind::Press {
        return false;
    }
    match key.code {
        KeyCode::Char(ABORT_KEY) => true,
        // raw mode swallows SIGINT, so honour Ctrl-C by hand
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

/// raise `abort` on SIGINT instead of killing the process
///
/// Outside a countdown the terminal is in cooked mode and Ctrl-C arrives as a
/// signal; the run then stops at its next state change, powers the scanner
/// off and still writes its report.
pub fn install_interrupt_handler(abort: &AbortFlag) -> Result<()> {
    let abort = abort.clone();
    ctrlc::set_handler(move || {
        if !abort.is_raised() {
            eprintln!("\r\nInterrupted, stopping at the next step...");
        }
        abort.raise();
    })
    .context("failed to install the interrupt handler")
}

/// countdown display on the terminal, abortable from the keyboard
///
/// The terminal is in raw mode only while a countdown is running so that log
/// output in between is not mangled.
pub struct ConsoleMonitor {
    out: Stdout,
    raw: bool,
    abort: AbortFlag,
}

impl ConsoleMonitor {
    pub fn new(abort: AbortFlag) -> Self {
        ConsoleMonitor {
            out: stdout(),
            raw: false,
            abort,
        }
    }

    fn leave_raw_mode(&mut self) {
        if self.raw {
            if let Err(err) = terminal::disable_raw_mode() {
                warn!("failed to restore terminal mode: {}", err);
            }
            self.raw = false;
        }
    }

    fn drain_keys(&mut self) -> std::io::Result<()> {
        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                if is_abort_key(&key) {
                    self.abort.raise();
                }
            }
        }
        Ok(())
    }
}

impl WaitMonitor for ConsoleMonitor {
    fn wait_started(&mut self, _reason: &WaitReason, _total: Duration) {
        let _ = writeln!(
            self.out,
            "Press capital \"{}\" to cancel the wait and abort the run.",
            ABORT_KEY
        );
        match terminal::enable_raw_mode() {
            Ok(()) => self.raw = true,
            Err(err) => warn!("keyboard abort unavailable: {}", err),
        }
    }

    fn remaining(&mut self, reason: &WaitReason, remaining: Duration) {
        let _ = queue!(self.out, MoveToColumn(0), Clear(ClearType::UntilNewLine));
        let _ = write!(self.out, "{}", status_line(reason, remaining));
        let _ = self.out.flush();
    }

    fn wait_finished(&mut self, _reason: &WaitReason, _outcome: CountdownOutcome) {
        self.leave_raw_mode();
        let _ = writeln!(self.out);
    }

    fn abort_requested(&mut self) -> bool {
        // keys typed outside a countdown arrive line buffered, only poll in raw mode
        if self.raw && !self.abort.is_raised() {
            if let Err(err) = self.drain_keys() {
                warn!("failed to read keyboard: {}", err);
            }
        }
        self.abort.is_raised()
    }
}

impl Drop for ConsoleMonitor {
    fn drop(&mut self) {
        self.leave_raw_mode();
    }
}
