//! Opaque, string-backed identifiers for the two kinds of graph node.
//!
//! Hosts name their cells and computations; internally the kernel resolves
//! those names to dense arena indices (see [`crate::graph`]) so that the hot
//! propagation and scheduling paths never touch a hash map.

use std::fmt;
use std::rc::Rc;

/// Identifies a source or computed cell. Globally unique within one kernel.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(Rc<str>);

/// Identifies a computation (the owner of zero or more output cells).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComputationId(Rc<str>);

macro_rules! opaque_id {
    ($ty:ident) => {
        impl $ty {
            /// Wraps a host-supplied name as an id.
            pub fn new(id: impl AsRef<str>) -> Self {
                $ty(Rc::from(id.as_ref()))
            }

            /// Borrows the underlying name.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($ty), self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<&str> for $ty {
            fn from(s: &str) -> Self {
                $ty::new(s)
            }
        }

        impl From<String> for $ty {
            fn from(s: String) -> Self {
                $ty::new(s)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_id!(VariableId);
opaque_id!(ComputationId);

/// Dense arena index for a [`crate::variable::Variable`]. Never reused while
/// the slot it names is live; stale keys are only ever compared, never
/// dereferenced, once a node is removed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct VarKey(pub(crate) u32);

/// Dense arena index for a [`crate::computation::Computation`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct CompKey(pub(crate) u32);

impl fmt::Debug for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarKey({})", self.0)
    }
}

impl fmt::Debug for CompKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompKey({})", self.0)
    }
}
