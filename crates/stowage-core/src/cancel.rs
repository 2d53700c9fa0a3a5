//! Two-stage user cancellation.
//!
//! The first interrupt only marks a cancel as pending. The next checkpoint
//! (reached after every streamed chunk or transferred part) asks a
//! [`CancelPrompt`] whether to stop. Declining clears the pending state; a
//! second interrupt arriving before the prompt is answered forces an
//! immediate exit.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Exit status used when the process is force-terminated by a second interrupt.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Marker error for an operation stopped by the user.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Operation cancelled by user")]
pub struct Cancelled;

/// Asks the user whether a pending interrupt should stop the operation.
pub trait CancelPrompt: Send + Sync {
    /// Return `true` to cancel, `false` to keep going.
    fn confirm_cancel(&self) -> bool;
}

/// Confirms every pending interrupt. Used when no terminal is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

impl CancelPrompt for AutoConfirm {
    fn confirm_cancel(&self) -> bool {
        true
    }
}

/// What a recorded interrupt means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// First signal: cancellation is pending confirmation.
    Pending,
    /// Repeated signal before confirmation: terminate now.
    Force,
}

struct Inner {
    interrupts: AtomicU32,
    cancelled: AtomicBool,
    prompting: Mutex<()>,
    prompt: Arc<dyn CancelPrompt>,
}

/// Shared cancellation state, cloned into every engine and transfer task.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("interrupts", &self.inner.interrupts.load(Ordering::SeqCst))
            .field("cancelled", &self.inner.cancelled.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Token whose pending interrupts are confirmed without asking.
    pub fn new() -> Self {
        Self::with_prompt(Arc::new(AutoConfirm))
    }

    /// Token that asks `prompt` before honoring a pending interrupt.
    pub fn with_prompt(prompt: Arc<dyn CancelPrompt>) -> Self {
        Self {
            inner: Arc::new(Inner {
                interrupts: AtomicU32::new(0),
                cancelled: AtomicBool::new(false),
                prompting: Mutex::new(()),
                prompt,
            }),
        }
    }

    /// Record an interrupt signal.
    pub fn interrupt(&self) -> Interrupt {
        let previous = self.inner.interrupts.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            Interrupt::Pending
        } else {
            Interrupt::Force
        }
    }

    /// Cancel without confirmation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been confirmed.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Whether an interrupt is waiting for confirmation.
    pub fn is_pending(&self) -> bool {
        self.inner.interrupts.load(Ordering::SeqCst) > 0
    }

    /// Observe cancellation at a chunk or part boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] when cancellation is (or becomes) confirmed.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        if !self.is_pending() {
            return Ok(());
        }

        // Another thread is already asking.
        let Ok(_guard) = self.inner.prompting.try_lock() else {
            return Ok(());
        };

        if self.inner.prompt.confirm_cancel() {
            self.cancel();
            tracing::info!("cancellation confirmed");
            Err(Cancelled)
        } else {
            self.inner.interrupts.store(0, Ordering::SeqCst);
            tracing::debug!("cancellation declined, continuing");
            Ok(())
        }
    }

    /// Listen for Ctrl-C (and SIGTERM on unix) for the life of the runtime.
    ///
    /// A second signal before the pending cancel is resolved exits the
    /// process with [`FORCED_EXIT_CODE`].
    pub fn install_signal_handler(&self) -> tokio::task::JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            loop {
                if wait_for_signal().await.is_err() {
                    tracing::warn!("failed to listen for interrupt signals");
                    return;
                }
                match token.interrupt() {
                    Interrupt::Pending => {
                        tracing::warn!("interrupt received; will ask at the next checkpoint");
                    }
                    Interrupt::Force => {
                        eprintln!("\nForced exit.");
                        std::process::exit(FORCED_EXIT_CODE);
                    }
                }
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
