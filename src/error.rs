//! User-facing operational errors (§7.4), distinct from the structural
//! problem/quarantine machinery in [`crate::result`].

use std::fmt;

use crate::ids::{ComputationId, VariableId};

/// Errors returned by facade operations for caller mistakes: unknown ids,
/// removing something that isn't there, redefining without opting in. These
/// are never silently swallowed; matches the teacher's manually-written
/// `Display` impl on `CycleError<K>` rather than pulling in a derive-macro
/// error crate for a handful of variants.
#[derive(Debug, Clone)]
pub enum KernelError {
    UnknownId(String),
    NotASource(VariableId),
    RemovalNotFound(String),
    RedefinitionNotAllowed(ComputationId),
    InvalidDynamicAccess { computation: ComputationId, variable: VariableId },
    InvariantViolation(String),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::UnknownId(id) => write!(f, "no variable or computation named `{id}`"),
            KernelError::NotASource(id) => write!(f, "`{id}` is not a source"),
            KernelError::RemovalNotFound(id) => write!(f, "nothing named `{id}` to remove"),
            KernelError::RedefinitionNotAllowed(id) => write!(
                f,
                "`{id}` is already defined; pass allow_redefinition to replace it"
            ),
            KernelError::InvalidDynamicAccess { computation, variable } => write!(
                f,
                "computation `{computation}` accessed `{variable}` dynamically without declaring it as an input"
            ),
            KernelError::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for KernelError {}

pub type KernelResult<T> = Result<T, KernelError>;
