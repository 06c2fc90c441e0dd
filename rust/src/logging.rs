//! A small ANSI-colored diagnostic logger, generalized from the teacher's
//! hand-rolled console logger: verbosity-gated info/error/debug/trace
//! lines, plus an on-demand status line driven by the engine's counters.

use std::sync::atomic::{AtomicBool, Ordering};

const GREEN: &str = "\x1b[0;32m";
const RED: &str = "\x1b[0;31m";
const MAGENTA: &str = "\x1b[0;35m";
const CYAN: &str = "\x1b[0;96m";
const NC: &str = "\x1b[0m";

pub struct Logger {
    verbose: u8,
    status_active: AtomicBool,
}

impl Logger {
    pub fn new(verbose: u8) -> Self {
        Self {
            verbose,
            status_active: AtomicBool::new(false),
        }
    }

    fn emit(&self, msg: &str) {
        if self.status_active.load(Ordering::Relaxed) {
            eprint!("\r\x1b[K");
        }
        eprintln!("{msg}");
    }

    pub fn info(&self, msg: &str) {
        self.emit(&format!("{GREEN}[INFO]{NC} {msg}"));
    }

    pub fn error(&self, msg: &str) {
        self.emit(&format!("{RED}[ERROR]{NC} {msg}"));
    }

    pub fn debug(&self, msg: &str) {
        if self.verbose >= 1 {
            self.emit(&format!("{MAGENTA}[DEBUG]{NC} {msg}"));
        }
    }

    pub fn trace(&self, msg: &str) {
        if self.verbose >= 2 {
            self.emit(&format!("{CYAN}[TRACE]{NC} {msg}"));
        }
    }

    /// Overwrites the current line with a status string (scan/fetch
    /// counts); shown only at the default verbosity (0), same as the
    /// teacher's spinner is suppressed once `-v` is passed.
    pub fn status(&self, msg: &str) {
        if self.verbose == 0 {
            self.status_active.store(true, Ordering::Relaxed);
            eprint!("\r\x1b[K{msg}");
        }
    }

    pub fn clear_status(&self) {
        if self.status_active.swap(false, Ordering::Relaxed) {
            eprint!("\r\x1b[K");
        }
    }
}
