#![warn(rust_2018_idioms)]

//! A glitch-free, push-pull reactive computation kernel.
//!
//! A [`Kernel`] maintains a dynamic graph of *source* cells (written
//! directly by the host) and *computed* cells (produced by async bodies
//! declared with [`Kernel::define_computation`]). Observing a cell schedules
//! whatever work is needed to keep it current; updating a source pushes a
//! dirty wave downward that the scheduler drains cooperatively, cancelling
//! in-flight work that a later update has superseded.
//!
//! Ill-formed definitions — a missing input, two computations claiming the
//! same output, a dependency cycle — never panic. They are quarantined into
//! a parallel "problem" status and are retried automatically whenever the
//! graph changes in a way that might fix them.

mod clock;
mod computation;
mod config;
mod error;
mod graph;
mod ids;
mod invariants;
mod kernel;
mod observer;
mod problem;
mod propagation;
mod result;
mod scheduler;
mod task;
mod value;
mod variable;

pub use crate::clock::LogicalClock;
pub use crate::computation::{BodyFuture, BodyOutputs, CompState};
pub use crate::config::{AbortStrategy, LogLevel, ReactiveModuleOptions};
pub use crate::error::{KernelError, KernelResult};
pub use crate::ids::{ComputationId, VariableId};
pub use crate::kernel::{
    ComputationSnapshot, DefinitionStatus, GraphHealth, Kernel, ProblemComputationInfo, ProblemVariableInfo,
    Scope, ScopeError, Unsubscribe, VariableSnapshot,
};
pub use crate::observer::ObserverCallback;
pub use crate::result::{CellResult, ProblemReason, StructuralError};
pub use crate::task::{Aborted, CancelToken};
pub use crate::value::{value, values_equal, DynValue, Value};

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn define_source_without_initial_value_is_uninitialized() {
        let kernel = Kernel::default();
        let id = VariableId::new("x");
        kernel.define_source(id.clone(), None);
        let snapshot = kernel.peek(&id).unwrap();
        assert!(matches!(snapshot.result, CellResult::Uninitialized));
        assert!(!snapshot.is_dirty);
    }

    #[test]
    fn define_source_with_initial_value_is_immediately_readable() {
        let kernel = Kernel::default();
        let id = VariableId::new("x");
        kernel.define_source(id.clone(), Some(value(1i64)));
        let snapshot = kernel.peek(&id).unwrap();
        match snapshot.result {
            CellResult::Success(v) => assert_eq!(*v.as_any().downcast_ref::<i64>().unwrap(), 1),
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn update_unknown_source_errors() {
        let kernel = Kernel::default();
        let result = kernel.update_source(&VariableId::new("nope"), value(1i64));
        assert!(result.is_err());
    }

    #[test]
    fn defining_computation_on_missing_input_is_problematic() {
        let kernel = Kernel::default();
        let body: crate::computation::BodyFn = Rc::new(|_scope, _cancel| {
            Box::pin(async { Ok(rustc_hash::FxHashMap::default()) })
        });
        let status = kernel.define_computation(
            "B",
            [VariableId::new("A")],
            [VariableId::new("vB")],
            body,
        );
        match status {
            DefinitionStatus::Problematic(errs) => {
                assert_eq!(errs[0].reason, ProblemReason::MissingInput);
            }
            DefinitionStatus::Healthy => panic!("expected a problematic definition"),
        }
        let snapshot = kernel.peek(&VariableId::new("vB")).unwrap();
        assert!(matches!(snapshot.result, CellResult::Fatal(_)));
    }
}
