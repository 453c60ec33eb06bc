use once_cell::sync::Lazy;
use regex::Regex;

// "45%" anywhere in a line, e.g. "  1,234,567  45%  10.00MB/s  0:00:05"
static PERCENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,3})%").expect("percent pattern is valid"));

// Files left to check out of the total, e.g. "(xfr#3, to-chk=40/100)"
static TO_CHECK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"to-chk=(\d+)/(\d+)").expect("to-chk pattern is valid"));

/// Turns rsync output lines into a deduplicated 0-100 progress signal.
///
/// A fresh tracker is created for every run, so nothing seen by an earlier
/// run can leak into the next one.
#[derive(Debug, Default, Clone)]
pub struct ProgressTracker {
    last: Option<u8>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one output line. Returns the new percentage only when it differs
    /// from the last one emitted.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let percent = extract_percent(line)?;
        if self.last == Some(percent) {
            return None;
        }
        self.last = Some(percent);
        Some(percent)
    }

    /// Value reported once the process has exited.
    pub fn final_value(&self, exit_code: i32) -> u8 {
        if exit_code == 0 {
            100
        } else {
            self.last.unwrap_or(0)
        }
    }
}

/// Explicit percentages win over the to-chk ratio.
pub fn extract_percent(line: &str) -> Option<u8> {
    if let Some(captures) = PERCENT_REGEX.captures(line) {
        // Up to three digits always fits in u16
        let value = captures[1].parse::<u16>().ok()?;
        return Some(value.min(100) as u8);
    }

    let captures = TO_CHECK_REGEX.captures(line)?;
    let left = captures[1].parse::<u64>().ok()?;
    let total = captures[2].parse::<u64>().ok()?;
    if total == 0 {
        return None;
    }
    let done = total - left.min(total);
    Some((done.saturating_mul(100) / total) as u8)
}
