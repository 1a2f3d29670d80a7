//! Progress reporting with TTY detection.
//!
//! Cron workers log plain lines; an operator at a terminal gets a progress
//! bar. The same `Reporter` is threaded through either way.

use std::io::IsTerminal;

use gardener::scheduler::Reporter;
use indicatif::{ProgressBar, ProgressStyle};

pub fn is_tty() -> bool {
    std::io::stderr().is_terminal()
}

/// Reporter for interactive runs: info lines ride the progress bar, warn
/// and error always print.
pub struct CliReporter {
    progress_bar: Option<ProgressBar>,
    verbose: bool,
}

impl CliReporter {
    pub fn new(verbose: bool) -> Self {
        let progress_bar = if is_tty() && !verbose {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            Some(pb)
        } else {
            None
        };
        Self {
            progress_bar,
            verbose,
        }
    }

    pub fn finish(&self) {
        if let Some(pb) = &self.progress_bar {
            pb.finish_and_clear();
        }
    }
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        match &self.progress_bar {
            Some(pb) => pb.set_message(msg.to_string()),
            None => {
                if self.verbose {
                    eprintln!("[info] {msg}");
                } else {
                    eprintln!("{msg}");
                }
            }
        }
    }

    fn warn(&mut self, msg: &str) {
        if let Some(pb) = &self.progress_bar {
            pb.suspend(|| eprintln!("[warn] {msg}"));
        } else {
            eprintln!("[warn] {msg}");
        }
    }

    fn error(&mut self, msg: &str) {
        if let Some(pb) = &self.progress_bar {
            pb.suspend(|| eprintln!("[error] {msg}"));
        } else {
            eprintln!("[error] {msg}");
        }
    }
}
