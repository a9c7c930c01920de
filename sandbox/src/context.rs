//! This module implements the cancellation handle threaded through every
//! blocking call of the judge worker.
//!

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::{Error, ErrorKind, Result};

/// Shared state of a `Context` and all of its clones.
struct Inner {
    /// Set once `cancel` is called on any clone.
    cancelled: AtomicBool,

    /// Absolute deadline of this context, if any.
    deadline: Option<Instant>,

    /// The parent context, if this context was derived with `child`.
    parent: Option<Context>,
}

/// A cancellation handle carrying an optional deadline.
///
/// Contexts form a tree: cancelling a context cancels every context derived
/// from it, and a child's deadline can only tighten its parent's. Cloning a
/// `Context` yields a handle to the same node.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Create a root context without a deadline.
    pub fn background() -> Self {
        Context {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                parent: None,
            }),
        }
    }

    /// Derive a child context without changing the deadline.
    pub fn child(&self) -> Self {
        Context {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: self.deadline(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Derive a child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context with the given absolute deadline. The parent's
    /// deadline wins when it is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline() {
            Some(parent_deadline) if parent_deadline < deadline => parent_deadline,
            _ => deadline,
        };

        Context {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(deadline),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether this context or any of its ancestors has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// The effective deadline of this context, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline.or_else(|| {
            self.inner.parent.as_ref().and_then(|parent| parent.deadline())
        })
    }

    /// Whether the effective deadline has passed.
    pub fn deadline_exceeded(&self) -> bool {
        match self.deadline() {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Time remaining until the effective deadline. `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline().map(|deadline| {
            deadline.saturating_duration_since(Instant::now())
        })
    }

    /// Return an error if this context has been cancelled or its deadline has
    /// passed.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::from(ErrorKind::Cancelled));
        }
        if self.deadline_exceeded() {
            return Err(Error::from(ErrorKind::DeadlineExceeded));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_active() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        assert!(ctx.deadline().is_none());
        assert!(ctx.ensure_active().is_ok());
    }

    #[test]
    fn cancel_propagates_to_children() {
        let root = Context::background();
        let child = root.child();
        let grandchild = child.child();

        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(grandchild.ensure_active().is_err());
    }

    #[test]
    fn cancel_does_not_propagate_to_parent() {
        let root = Context::background();
        let child = root.child();

        child.cancel();
        assert!(!root.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn deadline_tightens_only() {
        let root = Context::background();
        let near = root.with_timeout(Duration::from_millis(10));
        let wide = near.with_timeout(Duration::from_secs(3600));

        // The child cannot extend past the parent's deadline.
        assert!(wide.deadline().unwrap() <= Instant::now() + Duration::from_secs(1));
    }

    #[test]
    fn deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(ctx.deadline_exceeded());
        assert!(ctx.ensure_active().is_err());
    }
}
