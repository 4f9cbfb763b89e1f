//! Cooperative cancellation for long-running operations.
//!
//! A [`CancelToken`] is checked at suspension points (candidate loops, page
//! misses, fan-out joins). A canceled operation releases its locks and
//! returns [`VettoreError::Canceled`]; partial results are never surfaced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Result, VettoreError};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also fires once `deadline` passes.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Requests cancellation; observers see it at their next check.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        if self.flag.load(Ordering::Acquire) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Returns `Canceled` if the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(VettoreError::Canceled)
        } else {
            Ok(())
        }
    }
}
