//! Cooperative cancellation primitives.
//!
//! Cancellation is modeled as an explicit checked signal rather than future
//! drop: an aborted task keeps running until it notices, at its next
//! await-boundary, that its token has fired (§9 Design Notes, "Cancellation
//! as control flow").

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::clock::LogicalClock;

struct CancelInner {
    cancelled: Cell<bool>,
    parent: Option<CancelToken>,
}

/// A cooperatively-checked cancellation signal. Cloning shares the same
/// underlying flag; [`CancelToken::child`] creates a signal that also
/// reports cancelled once its parent does, without needing the parent to
/// proactively fire every descendant (pull-mode chaining, per §4.5's
/// "Abort strategies").
#[derive(Clone)]
pub struct CancelToken(Rc<CancelInner>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Rc::new(CancelInner {
            cancelled: Cell::new(false),
            parent: None,
        }))
    }

    /// A token that is also cancelled whenever `self` is.
    pub fn child(&self) -> Self {
        CancelToken(Rc::new(CancelInner {
            cancelled: Cell::new(false),
            parent: Some(self.clone()),
        }))
    }

    pub fn cancel(&self) {
        self.0.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.get() || self.0.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// A future that resolves once this token (or an ancestor) is
    /// cancelled. There is no wakeup event to subscribe to — `cancel()` is
    /// a plain flag flip from synchronous kernel code — so this polls and
    /// immediately re-arms its waker until the flag is observed set, which
    /// is fine for the short-lived internal waits this is used for
    /// (racing against a oneshot in [`crate::scheduler::evaluate`]).
    pub(crate) fn cancelled(&self) -> Cancelled {
        Cancelled(self.clone())
    }
}

pub(crate) struct Cancelled(CancelToken);

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0.is_cancelled() {
            Poll::Ready(())
        } else {
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

/// A control-flow sentinel thrown when a task notices its token fired.
/// Swallowed by the scheduler; never surfaced to hosts as a [`crate::result::CellResult::Error`].
#[derive(Clone, Copy, Debug)]
pub struct Aborted;

impl fmt::Display for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task aborted")
    }
}

impl std::error::Error for Aborted {}

pub(crate) type TaskId = u64;

/// A running body invocation attached to its owning computation.
pub(crate) struct TaskHandle {
    pub(crate) id: TaskId,
    /// `cause_at` snapshot the task was launched against; used to detect
    /// supersession per §4.4's `cause_at`-increase-while-Ready rule.
    pub(crate) cause_at: LogicalClock,
    pub(crate) cancel: CancelToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_token_observes_parent_cancellation() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn cancelling_child_does_not_cancel_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
