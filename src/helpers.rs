use anyhow::{Context, Result};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

// ============================================================================
// Shared Helpers
// ============================================================================

/// Largest local script accepted from a file or stdin (10 MB).
const MAX_LOCAL_SCRIPT_SIZE: u64 = 10 * 1024 * 1024;

pub(crate) fn retry_delay(attempt: usize) -> Duration {
    // Exponential backoff: 1s, 2s, 4s, 8s... capped at 30s
    let exponent = attempt.saturating_sub(1).min(16) as u32;
    let delay_secs = 2u64.pow(exponent).min(30);

    // Jitter from the clock so concurrent retries spread out
    let jitter_ms = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .subsec_nanos()
        % 1000;

    Duration::from_secs(delay_secs) + Duration::from_millis(jitter_ms as u64)
}

/// Spinner on stderr; hidden when `quiet` so JSON output stays clean.
pub(crate) fn new_spinner(msg: &str, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.set_message(msg.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

pub(crate) fn prompt(message: &str) -> Result<String> {
    print!("{}", message.bright_white().bold());
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    Ok(input.trim().to_string())
}

/// Read a script from a path, or from stdin when the path is `-`.
pub(crate) fn read_script_source(path: &Path) -> Result<String> {
    let mut bytes = Vec::new();
    if path == Path::new("-") {
        io::stdin()
            .take(MAX_LOCAL_SCRIPT_SIZE + 1)
            .read_to_end(&mut bytes)
            .context("Failed to read script from stdin")?;
    } else {
        std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?
            .take(MAX_LOCAL_SCRIPT_SIZE + 1)
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read {}", path.display()))?;
    }
    check_script_bytes(bytes)
}

/// Reject input that is not a plausible shell script.
pub(crate) fn check_script_bytes(bytes: Vec<u8>) -> Result<String> {
    if bytes.len() as u64 > MAX_LOCAL_SCRIPT_SIZE {
        anyhow::bail!(
            "Script too large (max {:.0} MB)",
            MAX_LOCAL_SCRIPT_SIZE as f64 / 1_048_576.0
        );
    }
    let script = String::from_utf8(bytes).context("Script is not valid UTF-8")?;
    if script.trim().is_empty() {
        anyhow::bail!("Script is empty");
    }
    if script.contains('\0') {
        anyhow::bail!(
            "Script contains null bytes. This may indicate a binary or corrupted file."
        );
    }
    Ok(script)
}
