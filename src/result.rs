//! The outcome a cell can hold, and the structural-problem diagnostics
//! attached to computations that cannot run.

use std::fmt;
use std::rc::Rc;

use crate::ids::{ComputationId, VariableId};
use crate::value::DynValue;

/// What a cell currently holds. Sources are always [`CellResult::Success`]
/// or [`CellResult::Uninitialized`]; computed cells can additionally hold
/// [`CellResult::Error`] (the computation's body rejected) or
/// [`CellResult::Fatal`] (the owning computation is structurally broken).
#[derive(Clone)]
pub enum CellResult {
    /// The cell holds a value produced by a write or a completed run.
    Success(DynValue),
    /// The owning computation's body returned an application-level error.
    Error(Rc<dyn std::error::Error>),
    /// The owning computation is quarantined; this cell cannot be computed.
    Fatal(StructuralError),
    /// The cell has never been written or successfully computed.
    Uninitialized,
}

impl fmt::Debug for CellResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellResult::Success(v) => f.debug_tuple("Success").field(v).finish(),
            CellResult::Error(e) => f.debug_tuple("Error").field(&e.to_string()).finish(),
            CellResult::Fatal(e) => f.debug_tuple("Fatal").field(e).finish(),
            CellResult::Uninitialized => write!(f, "Uninitialized"),
        }
    }
}

impl CellResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CellResult::Success(_))
    }

    pub fn as_value(&self) -> Option<&DynValue> {
        match self {
            CellResult::Success(v) => Some(v),
            _ => None,
        }
    }
}

/// Why a computation was placed in the problem sub-graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProblemReason {
    /// One or more declared static inputs do not resolve to a live cell.
    MissingInput,
    /// The computation participates in a dependency cycle.
    CircularDependency,
    /// The definition itself is malformed (e.g. an output name reused from
    /// the same computation, or zero outputs where the host requires one).
    InvalidDefinition,
    /// Another live computation already owns one of this computation's
    /// declared outputs.
    DuplicateOutput,
}

/// Diagnostic payload describing exactly why a computation is quarantined.
#[derive(Clone, Debug)]
pub struct StructuralError {
    pub reason: ProblemReason,
    pub computation: ComputationId,
    pub missing_inputs: Vec<VariableId>,
    pub cycle_path: Vec<ComputationId>,
    pub conflicting_producer: Option<ComputationId>,
}

impl StructuralError {
    pub(crate) fn missing_input(computation: ComputationId, missing_inputs: Vec<VariableId>) -> Self {
        StructuralError {
            reason: ProblemReason::MissingInput,
            computation,
            missing_inputs,
            cycle_path: Vec::new(),
            conflicting_producer: None,
        }
    }

    pub(crate) fn circular_dependency(computation: ComputationId, cycle_path: Vec<ComputationId>) -> Self {
        StructuralError {
            reason: ProblemReason::CircularDependency,
            computation,
            missing_inputs: Vec::new(),
            cycle_path,
            conflicting_producer: None,
        }
    }

    pub(crate) fn duplicate_output(computation: ComputationId, conflicting_producer: ComputationId) -> Self {
        StructuralError {
            reason: ProblemReason::DuplicateOutput,
            computation,
            missing_inputs: Vec::new(),
            cycle_path: Vec::new(),
            conflicting_producer: Some(conflicting_producer),
        }
    }

    pub(crate) fn invalid_definition(computation: ComputationId) -> Self {
        StructuralError {
            reason: ProblemReason::InvalidDefinition,
            computation,
            missing_inputs: Vec::new(),
            cycle_path: Vec::new(),
            conflicting_producer: None,
        }
    }
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            ProblemReason::MissingInput => write!(
                f,
                "computation `{}` has missing input(s): {}",
                self.computation,
                self.missing_inputs
                    .iter()
                    .map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            ProblemReason::CircularDependency => write!(
                f,
                "computation `{}` participates in a cycle: {}",
                self.computation,
                self.cycle_path
                    .iter()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ")
            ),
            ProblemReason::InvalidDefinition => {
                write!(f, "computation `{}` has an invalid definition", self.computation)
            }
            ProblemReason::DuplicateOutput => write!(
                f,
                "computation `{}` conflicts with `{}` over a shared output",
                self.computation,
                self.conflicting_producer
                    .as_ref()
                    .map(|c| c.as_str())
                    .unwrap_or("?")
            ),
        }
    }
}

impl std::error::Error for StructuralError {}
