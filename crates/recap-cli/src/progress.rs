//! Console reporting with TTY detection.
//!
//! In a terminal, range runs get a steady spinner and messages print above
//! it; piped output falls back to plain stderr lines.

use std::io::IsTerminal;
use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use recap::report::Reporter;

pub fn is_tty() -> bool {
    std::io::stderr().is_terminal()
}

/// Reporter for the CLI: plain `[level]` lines on stderr, routed through the
/// active progress bar when one is running so output does not tear.
pub struct ConsoleReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    /// Starts a spinner for a long-running phase. No-op when not a TTY.
    pub fn start_phase(&self, message: &str) {
        if !is_tty() {
            eprintln!("[info] {message}");
            return;
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        *self.bar.lock().unwrap() = Some(pb);
    }

    pub fn finish_phase(&self) {
        if let Some(pb) = self.bar.lock().unwrap().take() {
            pb.finish_and_clear();
        }
    }

    fn line(&self, level: &str, msg: &str) {
        let guard = self.bar.lock().unwrap();
        match guard.as_ref() {
            Some(pb) => pb.println(format!("[{level}] {msg}")),
            None => eprintln!("[{level}] {msg}"),
        }
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for ConsoleReporter {
    fn info(&self, msg: &str) {
        self.line("info", msg);
    }

    fn warn(&self, msg: &str) {
        self.line("warn", msg);
    }

    fn error(&self, msg: &str) {
        self.line("error", msg);
    }
}
