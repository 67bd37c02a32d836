//! Operator-derivation macros for single-field newtype wrappers.
//!
//! Money types in this workspace are thin wrappers around a single integer.
//! These macros forward the standard arithmetic traits to the inner value so
//! each wrapper does not have to spell out the boilerplate by hand.

#[macro_export]
macro_rules! op {
    (binary $t:ident, $op_trait:ident, $method:ident) => {
        impl std::ops::$op_trait for $t {
            type Output = Self;

            fn $method(self, rhs: Self) -> Self::Output {
                Self(std::ops::$op_trait::$method(self.0, rhs.0))
            }
        }
    };
    (inplace $t:ident, $op_trait:ident, $method:ident) => {
        impl std::ops::$op_trait for $t {
            fn $method(&mut self, rhs: Self) {
                std::ops::$op_trait::$method(&mut self.0, rhs.0)
            }
        }
    };
    (unary $t:ident, $op_trait:ident, $method:ident) => {
        impl std::ops::$op_trait for $t {
            type Output = Self;

            fn $method(self) -> Self::Output {
                Self(std::ops::$op_trait::$method(self.0))
            }
        }
    };
}
