//! Progress reporting for long key-space passes

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tracing::info;

/// How often a progress line is logged
pub const PROGRESS_INTERVAL: u64 = 100;

/// Running key counter with a periodic log line and an optional spinner
pub struct Progress {
    verb: &'static str,
    bar: ProgressBar,
}

impl Progress {
    /// `verb` completes the log line, e.g. "dumped" gives "... dumped 100 keys".
    pub fn new(verb: &'static str, visible: bool) -> Self {
        if !visible {
            return Self::hidden(verb);
        }

        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner} [{elapsed_precise}] {pos} keys {msg}");
        if let Ok(style) = style {
            bar.set_style(style);
        }
        bar.set_message(verb);
        bar.enable_steady_tick(Duration::from_millis(120));

        Self { verb, bar }
    }

    pub fn hidden(verb: &'static str) -> Self {
        Self {
            verb,
            bar: ProgressBar::hidden(),
        }
    }

    /// Record that `count` keys are done so far.
    ///
    /// Returns `true` when a progress line was logged for this count.
    pub fn update(&self, count: u64) -> bool {
        self.bar.set_position(count);
        if count == 0 || count % PROGRESS_INTERVAL != 0 {
            return false;
        }
        self.bar
            .suspend(|| info!(" ... {} {} keys", self.verb, count));
        true
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
