//! Progress reporting seam shared by every service.
//!
//! Stage services, the host client, and the LLM router report through this
//! trait instead of writing to stderr directly, so the CLI can route messages
//! through its progress display and tests can capture them.

use std::sync::{Arc, Mutex};

/// Sink for human-readable progress messages.
///
/// Implementations must be safe to share across worker threads; methods take
/// `&self` so a single handle can be cloned into every worker.
pub trait Reporter: Send + Sync {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Discards everything. Useful as a default and in tests that do not
/// assert on output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&self, _msg: &str) {}
    fn warn(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
}

/// Buffers messages in memory so tests can assert on what was reported.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    messages: Mutex<Vec<(Level, String)>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl CollectingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(Level, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == Level::Warn)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Reporter for CollectingReporter {
    fn info(&self, msg: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((Level::Info, msg.to_string()));
    }

    fn warn(&self, msg: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((Level::Warn, msg.to_string()));
    }

    fn error(&self, msg: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((Level::Error, msg.to_string()));
    }
}
