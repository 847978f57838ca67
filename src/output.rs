//! Colored terminal output for kmodctl
//!
//! Uses owo-colors for terminal colors and indicatif for spinners.

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::time::Duration;

/// Print an action header (blue, bold)
/// Example: "==> Inserting rtl2832"
pub fn action(message: &str) {
    println!("{} {}", "==>".blue().bold(), message.bold());
}

/// Print a detail line (dimmed)
/// Example: "     path: /lib/modules/..."
pub fn detail(message: &str) {
    println!("     {}", message.dimmed());
}

/// Print an info message (cyan)
pub fn info(message: &str) {
    println!("{} {}", "::".cyan(), message);
}

/// Print a warning message (yellow)
pub fn warning(message: &str) {
    eprintln!("{} {}", "warning:".yellow().bold(), message.yellow());
}

/// Print a key/value line, key padded to `width`
pub fn field(key: &str, value: &str, width: usize) {
    let key = format!("{:<width$}", format!("{}:", key), width = width + 1);
    println!("  {} {}", key.cyan(), value);
}

/// Print one module row in list output
/// Example: "  snd_hda_intel      61440  2"
pub fn module_row(name: &str, size: u64, refcnt: i32) {
    let used = if refcnt > 0 {
        format!("{}", refcnt.yellow())
    } else {
        format!("{}", refcnt.dimmed())
    };
    println!("  {} {:>10}  {}", format!("{:<24}", name).green(), size, used);
}

/// Create a spinner for a running insert/remove
pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .template("  {spinner:.cyan} {msg}")
        .map(|s| s.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"))
    {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Finish a spinner with a success message
pub fn progress_success(pb: ProgressBar, message: &str) {
    pb.finish_with_message(format!("{}", message.green()));
}

/// Finish a spinner with a failure message
pub fn progress_fail(pb: ProgressBar, message: &str) {
    pb.finish_with_message(format!("{}", message.red()));
}
