use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keel_types::ObjectId;

use crate::error::{TransportError, TransportResult};

/// Shared cancellation flag.
///
/// Clones observe the same flag. Cancelling is sticky: once set it cannot be
/// cleared, create a new signal for the next operation instead.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every operation observing this signal.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelSignal")
            .field(&self.is_cancelled())
            .finish()
    }
}

/// Progress callback: `(transport name, records processed since last call)`.
pub type ProgressFn = Arc<dyn Fn(&str, usize) + Send + Sync>;

/// Error callback: `(transport name, ids that did not land, the failure)`.
///
/// Called for every failed write, including ones a transport skips and
/// does not surface as an error.
pub type ErrorFn = Arc<dyn Fn(&str, &[ObjectId], &TransportError) + Send + Sync>;

/// Side channel attached to a transport.
///
/// Hooks are informational. Progress and error reports never influence the
/// outcome of an operation, and a cancelled operation still leaves
/// already-durable records in place.
#[derive(Clone, Default)]
pub struct TransportHooks {
    pub cancel: CancelSignal,
    pub on_progress: Option<ProgressFn>,
    pub on_error: Option<ErrorFn>,
}

impl TransportHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, on_progress: impl Fn(&str, usize) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }

    pub fn with_error_handler(
        mut self,
        on_error: impl Fn(&str, &[ObjectId], &TransportError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Forward a progress report, if anyone is listening.
    pub fn report(&self, transport: &str, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(cb) = &self.on_progress {
            cb(transport, count);
        }
    }

    /// Forward a failed write of `ids`.
    pub fn report_error(&self, transport: &str, ids: &[ObjectId], err: &TransportError) {
        if let Some(cb) = &self.on_error {
            cb(transport, ids, err);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`TransportError::Cancelled`] if cancellation was requested.
    pub fn ensure_active(&self, transport: &str, completed: &[ObjectId]) -> TransportResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled {
                transport: transport.to_string(),
                completed: completed.to_vec(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for TransportHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHooks")
            .field("cancel", &self.cancel)
            .field("on_progress", &self.on_progress.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
