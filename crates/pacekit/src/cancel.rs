//! Cooperative cancellation with an optional deadline
//!
//! Every blocking operation in this crate accepts a [`Cancellation`]. It wraps a
//! [`CancellationToken`] so callers can share one signal across many waits, and
//! optionally carries a deadline after which the signal fires on its own.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a blocking operation gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    /// The token was cancelled explicitly
    #[error("operation was cancelled")]
    Cancelled,

    /// The deadline passed before the operation could proceed
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation signal passed to blocking operations
///
/// Cloning is cheap and all clones observe the same token. A default
/// `Cancellation` never fires unless [`Cancellation::cancel`] is called.
///
/// # Example
///
/// ```
/// use pacekit::Cancellation;
/// use std::time::Duration;
///
/// let cancel = Cancellation::with_timeout(Duration::from_secs(5));
/// assert!(cancel.check().is_ok());
///
/// cancel.cancel();
/// assert!(cancel.check().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// Create a signal that only fires when cancelled explicitly
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing token
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Create a signal that fires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Create a signal that fires after `timeout`
    ///
    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    /// Derive a signal that fires when this one does, but can also be
    /// cancelled on its own without affecting the parent
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Fire the signal
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The underlying token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the signal has fired (explicitly or by deadline)
    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// Return an error if the signal has fired
    pub fn check(&self) -> Result<(), CancelError> {
        if self.token.is_cancelled() {
            return Err(CancelError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(CancelError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Wait until the signal fires and report why
    pub async fn cancelled(&self) -> CancelError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => CancelError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CancelError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                CancelError::Cancelled
            }
        }
    }
}
