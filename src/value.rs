//! Structural equality over arbitrary host values.
//!
//! Recomputation is only worth propagating when the result actually changed.
//! Hosts hand the kernel opaque values of any `Debug + PartialEq` type; we
//! erase that type behind a small trait object and compare cheaply by
//! identity before falling back to a real structural compare.

use std::any::Any;
use std::fmt::Debug;
use std::rc::Rc;

/// A value a source or computation can hold. Implemented automatically for
/// any type that is `Debug + PartialEq + 'static`; hosts never implement
/// this by hand.
pub trait Value: Debug {
    fn as_any(&self) -> &dyn Any;
    fn deep_eq(&self, other: &dyn Value) -> bool;
}

impl<T> Value for T
where
    T: Debug + PartialEq + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn deep_eq(&self, other: &dyn Value) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }
}

/// A type-erased, reference-counted host value. Cheap to clone; cells store
/// one of these per held result.
pub type DynValue = Rc<dyn Value>;

/// Wraps a concrete value as a [`DynValue`].
pub fn value<T: Debug + PartialEq + 'static>(v: T) -> DynValue {
    Rc::new(v)
}

/// Compares two values for the "did this actually change" test: an identity
/// check first (two clones of the same `Rc` are trivially equal, and this
/// also lets hosts opt out of structural comparison by never cloning), then
/// a structural fallback. Values of differing concrete types are never
/// equal.
pub fn values_equal(a: &DynValue, b: &DynValue) -> bool {
    if Rc::ptr_eq(a, b) {
        return true;
    }
    a.deep_eq(b.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_rc_is_equal_without_structural_compare() {
        let v = value(42i32);
        let clone = Rc::clone(&v);
        assert!(values_equal(&v, &clone));
    }

    #[test]
    fn structurally_equal_values_compare_equal() {
        let a = value(String::from("hi"));
        let b = value(String::from("hi"));
        assert!(values_equal(&a, &b));
    }

    #[test]
    fn differing_values_compare_unequal() {
        let a = value(1i32);
        let b = value(2i32);
        assert!(!values_equal(&a, &b));
    }

    #[test]
    fn differing_concrete_types_are_never_equal() {
        let a: DynValue = value(1i32);
        let b: DynValue = value(1i64);
        assert!(!values_equal(&a, &b));
    }
}
