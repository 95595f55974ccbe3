//! The computation: owner of one or more output cells, plus the three-state
//! automaton that drives scheduling.

use indexmap::IndexSet;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;

use crate::clock::LogicalClock;
use crate::ids::{ComputationId, VarKey};
use crate::result::StructuralError;
use crate::task::{TaskHandle, TaskId};
use crate::value::DynValue;

/// The three reachable states of a computation (§3, "State automaton").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompState {
    Idle,
    Pending,
    Ready,
}

/// Pure classification function: the state is entirely determined by these
/// three fields, never stored redundantly.
pub(crate) fn classify(dirty: bool, observe_count: u32, dirty_input_count: u32) -> CompState {
    if !dirty || observe_count == 0 {
        CompState::Idle
    } else if dirty_input_count > 0 {
        CompState::Pending
    } else {
        CompState::Ready
    }
}

/// What a caller must do after a field mutation changed (or didn't change)
/// a computation's classification. Mutators return this instead of acting
/// on the scheduler themselves, keeping the reaction explicit and
/// non-reentrant (§4.4 "Implementation note (ports)").
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    /// No action required.
    NoOp,
    /// The running task (if any) must be cancelled and moved into
    /// `aborting_tasks`; scheduling should be re-evaluated afterward.
    Abort,
    /// The computation has entered Ready with no task running: enqueue it.
    Schedule,
}

/// Status of a computation: healthy members of the normal graph, or
/// quarantined per §9's merged-table simplification ("carry a status
/// attribute" rather than two parallel arenas).
pub(crate) enum CompStatus {
    Normal,
    Problem(Box<ProblemState>),
}

pub(crate) struct ProblemState {
    pub(crate) error: StructuralError,
    pub(crate) missing_inputs: FxHashSet<crate::ids::VariableId>,
    pub(crate) conflicts_with: Option<ComputationId>,
}

/// An async computation body: takes a scope (for dynamic input access) and
/// a cancellation token, returns output values keyed by output id.
pub type BodyOutputs = FxHashMap<String, DynValue>;
pub type BodyFuture = Pin<Box<dyn std::future::Future<Output = Result<BodyOutputs, Rc<dyn std::error::Error>>>>>;
pub type BodyFn = Rc<dyn Fn(crate::kernel::Scope, crate::task::CancelToken) -> BodyFuture>;

/// The immutable shape of a computation as the host declared it.
pub(crate) struct ComputationDef {
    pub(crate) id: ComputationId,
    pub(crate) static_inputs: IndexSet<crate::ids::VariableId>,
    pub(crate) output_ids: Vec<crate::ids::VariableId>,
    pub(crate) body: BodyFn,
}

impl fmt::Debug for ComputationDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationDef")
            .field("id", &self.id)
            .field("static_inputs", &self.static_inputs)
            .field("output_ids", &self.output_ids)
            .finish()
    }
}

pub(crate) struct Computation {
    pub(crate) def: ComputationDef,
    pub(crate) status: CompStatus,

    /// Variables actually touched on the last successful execution.
    pub(crate) runtime_inputs: IndexSet<VarKey>,
    /// Arena keys of owned outputs; `None` where a slot lost a conflict and
    /// the name is owned by another computation (not created at all).
    pub(crate) outputs: Vec<Option<VarKey>>,

    pub(crate) dirty: bool,
    pub(crate) observe_count: u32,
    pub(crate) dirty_input_count: u32,
    pub(crate) cause_at: LogicalClock,
    /// Max `value_at` seen among runtime inputs during the last successful
    /// execution. `None` means never executed.
    pub(crate) input_version: Option<LogicalClock>,

    pub(crate) running_task: Option<TaskHandle>,
    pub(crate) aborting_tasks: FxHashSet<TaskId>,
}

impl Computation {
    pub(crate) fn state(&self) -> CompState {
        classify(self.dirty, self.observe_count, self.dirty_input_count)
    }

    pub(crate) fn is_problem(&self) -> bool {
        matches!(self.status, CompStatus::Problem(_))
    }

    /// Sets `dirty` and returns the resulting [`Transition`]. `from_dirty`
    /// distinguishes the two Ready→Idle causes of §4.4: turning dirty off
    /// (a successful/erroring completion entering cleanup) must never
    /// abort, even though it can also drop the state to Idle.
    pub(crate) fn set_dirty(&mut self, new: bool) -> Transition {
        let before = self.state();
        self.dirty = new;
        let after = self.state();
        if before == after {
            return Transition::NoOp;
        }
        match (before, after) {
            (CompState::Ready, CompState::Pending) => Transition::Abort,
            (CompState::Ready, CompState::Idle) => Transition::NoOp,
            (_, CompState::Ready) if self.running_task.is_none() => Transition::Schedule,
            _ => Transition::NoOp,
        }
    }

    /// Sets `observe_count` by `delta` (may be negative via wrapping add on
    /// an i64 caller-side; stored as u32 so callers pass the already-applied
    /// new value) and returns the transition. Ready→Idle via
    /// `observe_count → 0` *does* abort (§4.4): the work would be wasted.
    pub(crate) fn set_observe_count(&mut self, new: u32) -> Transition {
        let before = self.state();
        self.observe_count = new;
        let after = self.state();
        if before == after {
            return Transition::NoOp;
        }
        match (before, after) {
            (CompState::Ready, CompState::Idle) => Transition::Abort,
            (_, CompState::Ready) if self.running_task.is_none() => Transition::Schedule,
            _ => Transition::NoOp,
        }
    }

    pub(crate) fn set_dirty_input_count(&mut self, new: u32) -> Transition {
        let before = self.state();
        self.dirty_input_count = new;
        let after = self.state();
        if before == after {
            return Transition::NoOp;
        }
        match (before, after) {
            (CompState::Ready, CompState::Pending) => Transition::Abort,
            (_, CompState::Ready) if self.running_task.is_none() => Transition::Schedule,
            _ => Transition::NoOp,
        }
    }

    /// Sets `cause_at`. Unlike the other three fields this never changes
    /// the (dirty, observe_count, dirty_input_count) classification by
    /// itself, but while Ready with a running task it can supersede that
    /// task's captured snapshot (§4.4, third bullet).
    pub(crate) fn set_cause_at(&mut self, new: LogicalClock) -> Transition {
        self.cause_at = new;
        if self.state() == CompState::Ready {
            if let Some(task) = &self.running_task {
                if task.cause_at < new {
                    return Transition::Abort;
                }
            }
        }
        Transition::NoOp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_table() {
        assert_eq!(classify(false, 0, 0), CompState::Idle);
        assert_eq!(classify(false, 3, 0), CompState::Idle);
        assert_eq!(classify(true, 0, 5), CompState::Idle);
        assert_eq!(classify(true, 1, 1), CompState::Pending);
        assert_eq!(classify(true, 1, 0), CompState::Ready);
    }

    fn fresh(body: BodyFn) -> Computation {
        Computation {
            def: ComputationDef {
                id: ComputationId::new("c"),
                static_inputs: IndexSet::new(),
                output_ids: vec![],
                body,
            },
            status: CompStatus::Normal,
            runtime_inputs: IndexSet::new(),
            outputs: vec![],
            dirty: false,
            observe_count: 0,
            dirty_input_count: 0,
            cause_at: LogicalClock::START,
            input_version: None,
            running_task: None,
            aborting_tasks: FxHashSet::default(),
        }
    }

    fn dummy_body() -> BodyFn {
        Rc::new(|_scope, _cancel| Box::pin(async { Ok(FxHashMap::default()) }))
    }

    #[test]
    fn dirty_to_true_with_observer_schedules() {
        let mut c = fresh(dummy_body());
        c.observe_count = 1;
        assert_eq!(c.set_dirty(true), Transition::Schedule);
    }

    #[test]
    fn observe_count_drop_to_zero_while_ready_aborts() {
        let mut c = fresh(dummy_body());
        c.dirty = true;
        c.observe_count = 1;
        assert_eq!(c.state(), CompState::Ready);
        assert_eq!(c.set_observe_count(0), Transition::Abort);
    }

    #[test]
    fn dirty_false_while_ready_does_not_abort() {
        let mut c = fresh(dummy_body());
        c.dirty = true;
        c.observe_count = 1;
        assert_eq!(c.state(), CompState::Ready);
        assert_eq!(c.set_dirty(false), Transition::NoOp);
    }

    #[test]
    fn dirty_input_count_increase_from_ready_aborts() {
        let mut c = fresh(dummy_body());
        c.dirty = true;
        c.observe_count = 1;
        assert_eq!(c.state(), CompState::Ready);
        assert_eq!(c.set_dirty_input_count(1), Transition::Abort);
    }

    #[test]
    fn cause_at_increase_while_running_task_stale_aborts() {
        let mut c = fresh(dummy_body());
        c.dirty = true;
        c.observe_count = 1;
        c.running_task = Some(TaskHandle {
            id: 1,
            cause_at: LogicalClock::START,
            cancel: crate::task::CancelToken::new(),
        });
        let bumped = {
            let clock = crate::clock::Clock::default();
            clock.tick()
        };
        assert_eq!(c.set_cause_at(bumped), Transition::Abort);
    }
}
