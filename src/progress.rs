//! Progress indicators for the LUMEN CLI.
//!
//! Provides spinners and progress bars for long-running operations,
//! chiefly dependency installation.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Global quiet mode flag
static QUIET_MODE: AtomicBool = AtomicBool::new(false);

/// Set global quiet mode
pub fn set_quiet(quiet: bool) {
    QUIET_MODE.store(quiet, Ordering::SeqCst);
}

/// Check if quiet mode is enabled
pub fn is_quiet() -> bool {
    QUIET_MODE.load(Ordering::SeqCst)
}

// =============================================================================
// Status Indicators
// =============================================================================
// [+] - Success
// [-] - Error
// [!] - Warning
// [*] - Info
// =============================================================================

/// Braille spinner frames
pub const BRAILLE_SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Success indicator
pub const STATUS_SUCCESS: &str = "[+]";

/// Warning indicator
pub const STATUS_WARNING: &str = "[!]";

/// Error indicator
pub const STATUS_ERROR: &str = "[-]";

/// Info indicator
pub const STATUS_INFO: &str = "[*]";

/// Create a spinner for indefinite operations
pub fn spinner(message: &str) -> ProgressBar {
    if is_quiet() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(BRAILLE_SPINNER)
            .template("{spinner} {msg}")
            .unwrap(),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Create a percentage progress bar for multi-package installs
pub fn install_progress_bar(total: u64, message: &str) -> ProgressBar {
    if is_quiet() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{msg}\n      [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)",
            )
            .unwrap()
            .progress_chars("█░-"),
    );
    pb.set_message(message.to_string());
    pb
}

/// Finish a spinner with success
pub fn finish_success(pb: &ProgressBar, message: &str) {
    pb.set_style(ProgressStyle::default_spinner().template("{msg}").unwrap());
    pb.finish_with_message(format!("{} {}", STATUS_SUCCESS, style(message).green()));
}

/// Finish a spinner with warning
pub fn finish_warning(pb: &ProgressBar, message: &str) {
    pb.set_style(ProgressStyle::default_spinner().template("{msg}").unwrap());
    pb.finish_with_message(format!("{} {}", STATUS_WARNING, style(message).yellow()));
}

/// Finish a spinner with error
pub fn finish_error(pb: &ProgressBar, message: &str) {
    pb.set_style(ProgressStyle::default_spinner().template("{msg}").unwrap());
    pb.finish_with_message(format!("{} {}", STATUS_ERROR, style(message).red()));
}
