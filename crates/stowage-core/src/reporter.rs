//! Reporter trait for dependency injection
//!
//! Engines and orchestrators narrate what they do through this trait so
//! they are not coupled to a terminal. Structured diagnostics go to
//! `tracing`; this is the user-facing channel.

use std::sync::Arc;

use stowage_schema::Component;

/// Progress callback receiving `(processed_bytes, total_bytes)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

pub trait Reporter: Send + Sync {
    /// Indicates a new section or phase has started (e.g. "Publishing").
    fn section(&self, title: &str);

    /// Updates the progress of an upload or download.
    fn transferring(&self, component: &Component, current: u64, total: Option<u64>);

    /// Updates the progress of an archive or extraction.
    fn archiving(&self, component: &Component, current: u64, total: Option<u64>);

    /// Marks a component operation as successfully completed.
    fn done(&self, component: &Component, detail: &str, size: Option<u64>);

    /// Marks a component operation as failed with a specific reason.
    fn failed(&self, component: &Component, reason: &str);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Log an error message.
    fn error(&self, msg: &str);

    /// Display a final summary of multiple operations.
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64);
}

impl<T: Reporter + ?Sized> Reporter for Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn transferring(&self, component: &Component, current: u64, total: Option<u64>) {
        (**self).transferring(component, current, total);
    }
    fn archiving(&self, component: &Component, current: u64, total: Option<u64>) {
        (**self).archiving(component, current, total);
    }
    fn done(&self, component: &Component, detail: &str, size: Option<u64>) {
        (**self).done(component, detail, size);
    }
    fn failed(&self, component: &Component, reason: &str) {
        (**self).failed(component, reason);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn error(&self, msg: &str) {
        (**self).error(msg);
    }
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        (**self).summary(count, action, elapsed_secs);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _title: &str) {}
    fn transferring(&self, _component: &Component, _current: u64, _total: Option<u64>) {}
    fn archiving(&self, _component: &Component, _current: u64, _total: Option<u64>) {}
    fn done(&self, _component: &Component, _detail: &str, _size: Option<u64>) {}
    fn failed(&self, _component: &Component, _reason: &str) {}
    fn info(&self, _msg: &str) {}
    fn warning(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
    fn summary(&self, _count: usize, _action: &str, _elapsed_secs: f64) {}
}

/// Adapt a reporter into a byte-progress callback for one component.
pub fn transfer_progress(reporter: Arc<dyn Reporter>, component: Component) -> ProgressFn {
    Arc::new(move |current, total| {
        reporter.transferring(&component, current, Some(total));
    })
}

/// Adapt a reporter into an archive-progress callback for one component.
pub fn archive_progress(reporter: Arc<dyn Reporter>, component: Component) -> ProgressFn {
    Arc::new(move |current, total| {
        reporter.archiving(&component, current, Some(total));
    })
}
