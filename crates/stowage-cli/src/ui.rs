//! Terminal output.
//!
//! `ConsoleReporter` renders orchestrator narration on stderr so stdout
//! stays clean for `--json`. Byte progress is throttled to whole-percent
//! steps per component.

use std::collections::HashMap;
use std::io::{BufRead, IsTerminal, Write};
use std::sync::Mutex;

use stowage_core::{CancelPrompt, Reporter};
use stowage_schema::Component;

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Progress as a whole percentage, `None` when the total is unknown.
pub fn percent(current: u64, total: Option<u64>) -> Option<u8> {
    let total = total.filter(|&t| t > 0)?;
    Some((current.min(total) * 100 / total) as u8)
}

#[derive(Debug)]
pub struct ConsoleReporter {
    quiet: bool,
    interactive: bool,
    last: Mutex<HashMap<Component, u8>>,
}

impl ConsoleReporter {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            interactive: std::io::stderr().is_terminal(),
            last: Mutex::new(HashMap::new()),
        }
    }

    fn progress(&self, verb: &str, component: &Component, current: u64, total: Option<u64>) {
        if self.quiet || !self.interactive {
            return;
        }
        let Some(pct) = percent(current, total) else {
            return;
        };
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if last.get(component) == Some(&pct) {
            return;
        }
        last.insert(component.clone(), pct);
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r  {verb:<10} {:<32} {pct:>3}%", component.to_string());
        let _ = err.flush();
    }

    fn line(&self, text: &str) {
        let mut err = std::io::stderr().lock();
        if self.interactive {
            let _ = write!(err, "\r\x1b[2K");
        }
        let _ = writeln!(err, "{text}");
    }
}

impl Reporter for ConsoleReporter {
    fn section(&self, title: &str) {
        if !self.quiet {
            self.line(&format!("\n{title}"));
        }
    }

    fn transferring(&self, component: &Component, current: u64, total: Option<u64>) {
        self.progress("transfer", component, current, total);
    }

    fn archiving(&self, component: &Component, current: u64, total: Option<u64>) {
        self.progress("archive", component, current, total);
    }

    fn done(&self, component: &Component, detail: &str, size: Option<u64>) {
        if let Ok(mut last) = self.last.lock() {
            last.remove(component);
        }
        if self.quiet {
            return;
        }
        match size {
            Some(size) => self.line(&format!(
                "  ✓ {:<32} {detail} ({})",
                component.to_string(),
                format_size(size)
            )),
            None => self.line(&format!("  ✓ {:<32} {detail}", component.to_string())),
        }
    }

    fn failed(&self, component: &Component, reason: &str) {
        if let Ok(mut last) = self.last.lock() {
            last.remove(component);
        }
        self.line(&format!("  ✗ {:<32} {reason}", component.to_string()));
    }

    fn info(&self, msg: &str) {
        if !self.quiet {
            self.line(&format!("  {msg}"));
        }
    }

    fn warning(&self, msg: &str) {
        self.line(&format!("  warning: {msg}"));
    }

    fn error(&self, msg: &str) {
        self.line(&format!("  error: {msg}"));
    }

    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        if !self.quiet {
            let noun = if count == 1 { "component" } else { "components" };
            self.line(&format!("\n{count} {noun} {action} in {elapsed_secs:.1}s"));
        }
    }
}

/// Asks on the terminal before honoring an interrupt. Defaults to "no".
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl CancelPrompt for TerminalPrompt {
    fn confirm_cancel(&self) -> bool {
        if !std::io::stdin().is_terminal() {
            return true;
        }
        eprint!("\nInterrupt the operation? [y/N] ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return true;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(10 * 1024), "10.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024 / 2), "1.5 MB");
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, Some(200)), Some(0));
        assert_eq!(percent(100, Some(200)), Some(50));
        assert_eq!(percent(300, Some(200)), Some(100));
        assert_eq!(percent(5, Some(0)), None);
        assert_eq!(percent(5, None), None);
    }
}
