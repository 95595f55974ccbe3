//! Observer callback storage.
//!
//! Callbacks are invoked synchronously from propagation sites (§5: "Observer
//! callbacks are invoked synchronously... they must be non-blocking and must
//! not throw"). A panicking callback is caught at the call site and logged,
//! never allowed to unwind through kernel bookkeeping.

use std::rc::Rc;

use log::error;

use crate::result::CellResult;

pub type ObserverCallback = Rc<dyn Fn(&CellResult)>;

/// A registration handle for one observer. Dropping it does *not*
/// unsubscribe; callers must invoke [`Kernel::unsubscribe`] via the closure
/// returned by `observe` (mirrors the spec's explicit `unsubscribe()`
/// handle rather than RAII).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct ObserverToken(pub(crate) u64);

#[derive(Default)]
pub(crate) struct ObserverSet {
    next_token: u64,
    entries: Vec<(ObserverToken, ObserverCallback)>,
}

impl ObserverSet {
    pub(crate) fn insert(&mut self, callback: ObserverCallback) -> ObserverToken {
        let token = ObserverToken(self.next_token);
        self.next_token += 1;
        self.entries.push((token, callback));
        token
    }

    pub(crate) fn remove(&mut self, token: ObserverToken) {
        self.entries.retain(|(t, _)| *t != token);
    }

    /// Removes and returns one callback by token, e.g. to carry it across a
    /// computation redefinition onto a freshly-created output cell (§4.6
    /// "Redefinition").
    pub(crate) fn take(&mut self, token: ObserverToken) -> Option<ObserverCallback> {
        let pos = self.entries.iter().position(|(t, _)| *t == token)?;
        Some(self.entries.remove(pos).1)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Invokes every observer with the given result, swallowing panics so
    /// one broken host callback can't corrupt kernel state.
    pub(crate) fn notify(&self, result: &CellResult) {
        for (_, callback) in &self.entries {
            let callback = Rc::clone(callback);
            let result_owned = result.clone();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&result_owned);
            }));
            if outcome.is_err() {
                error!("observer callback panicked; ignoring");
            }
        }
    }
}
