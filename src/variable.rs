//! The cell: a source or a computed output, holding a [`CellResult`] plus
//! the bookkeeping propagation needs.

use rustc_hash::FxHashSet;

use crate::clock::LogicalClock;
use crate::ids::{CompKey, VarKey};
use crate::observer::ObserverSet;
use crate::result::CellResult;

/// One node of the reactive graph: either a source (no producer) or the
/// output of exactly one computation.
pub(crate) struct Variable {
    pub(crate) result: CellResult,
    /// Time this cell's value last actually changed.
    pub(crate) value_at: LogicalClock,
    /// Time an upstream perturbation last reached this cell.
    pub(crate) cause_at: LogicalClock,
    pub(crate) dirty: bool,
    /// `None` for a source; `Some` for a computed cell.
    pub(crate) producer: Option<CompKey>,
    pub(crate) dependents: FxHashSet<CompKey>,
    pub(crate) observers: ObserverSet,
    pub(crate) observe_count: u32,
}

impl Variable {
    pub(crate) fn new_source() -> Self {
        Variable {
            result: CellResult::Uninitialized,
            value_at: LogicalClock::START,
            cause_at: LogicalClock::START,
            dirty: false,
            producer: None,
            dependents: FxHashSet::default(),
            observers: ObserverSet::default(),
            observe_count: 0,
        }
    }

    /// A computed cell starts dirty: it has never run, so it is always
    /// "stale relative to nothing" until its first successful commit marks
    /// it clean. Quarantined (problem) outputs are the one exception —
    /// callers that install a `Fatal` result override this back to `false`,
    /// since a cell that will never execute isn't "pending" in any
    /// meaningful sense ([`crate::problem::define_computation`]).
    pub(crate) fn new_output(producer: CompKey) -> Self {
        Variable {
            result: CellResult::Uninitialized,
            value_at: LogicalClock::START,
            cause_at: LogicalClock::START,
            dirty: true,
            producer: Some(producer),
            dependents: FxHashSet::default(),
            observers: ObserverSet::default(),
            observe_count: 0,
        }
    }

    pub(crate) fn is_source(&self) -> bool {
        self.producer.is_none()
    }
}
