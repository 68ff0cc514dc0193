//! Execution context threaded through every public operation.
//!
//! The context carries a deadline, a cancellation token, and the caller's
//! identity. Child contexts always inherit all three: downstream ACL checks
//! depend on the caller id surviving every hop, including internal
//! bookkeeping reads like the consistent-lookup liveness check.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// The identity of the end caller, attached to every downstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId {
    /// The authenticated principal (user or service account).
    pub principal: String,
    /// The component the request entered through.
    pub component: String,
}

impl CallerId {
    pub fn new(principal: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            component: component.into(),
        }
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.principal, self.component)
    }
}

/// Cancellation- and deadline-aware execution context.
#[derive(Debug, Clone)]
pub struct ExecContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    caller: Option<Arc<CallerId>>,
}

impl ExecContext {
    /// A context with no deadline and no caller identity.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
            caller: None,
        }
    }

    /// Attach a caller identity.
    pub fn with_caller(mut self, caller: CallerId) -> Self {
        self.caller = Some(Arc::new(caller));
        self
    }

    /// Attach a deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Derive a child context. The child inherits deadline and caller, and
    /// its token is cancelled when the parent's is.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
            caller: self.caller.clone(),
        }
    }

    pub fn caller(&self) -> Option<&CallerId> {
        self.caller.as_deref()
    }

    /// Errors unless a caller identity is present.
    pub fn require_caller(&self) -> Result<&CallerId> {
        self.caller().ok_or(Error::MissingCallerId)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time remaining before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation of this context and all children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Returns an error if the context is no longer live. Suspension points
    /// call this before doing work.
    pub fn checked(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Canceled("context cancelled".into()));
        }
        if self.is_deadline_exceeded() {
            return Err(Error::DeadlineExceeded("context deadline exceeded".into()));
        }
        Ok(())
    }

    /// Await cancellation or deadline, whichever comes first. Returns the
    /// corresponding error; never returns Ok.
    pub async fn done(&self) -> Error {
        match self.remaining() {
            Some(remaining) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Error::Canceled("context cancelled".into()),
                    _ = tokio::time::sleep(remaining) => {
                        Error::DeadlineExceeded("context deadline exceeded".into())
                    }
                }
            }
            None => {
                self.cancel.cancelled().await;
                Error::Canceled("context cancelled".into())
            }
        }
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::background()
    }
}
