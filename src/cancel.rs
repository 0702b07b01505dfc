//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shareable flag that asks a running extraction to stop.
///
/// Cancellation is cooperative: the extractor checks the flag before every
/// copy and between copy chunks, and removes any partial destination before
/// returning [`Error::Cancelled`](crate::Error::Cancelled).
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// Creates a flag that is not raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Every clone observes it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once the flag has been raised.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Raises the wrapped flag when dropped, unless disarmed first.
///
/// Ties an in-flight request to the lifetime of whatever awaits it.
#[derive(Debug)]
pub(crate) struct CancelOnDrop {
    flag: CancellationFlag,
    armed: bool,
}

impl CancelOnDrop {
    pub(crate) fn new(flag: CancellationFlag) -> Self {
        Self { flag, armed: true }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.cancel();
        }
    }
}
