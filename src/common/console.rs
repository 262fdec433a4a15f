//! Serialized console output
//!
//! Workers print progress lines concurrently; the lock keeps lines whole.
//! It protects no program state.

use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct Console {
    lock: Arc<Mutex<()>>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// Print one line to stdout while holding the lock
    pub fn line(&self, text: impl std::fmt::Display) {
        // A poisoned lock only means another printer panicked mid-line
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(out, "{}", text);
        let _ = out.flush();
    }
}
