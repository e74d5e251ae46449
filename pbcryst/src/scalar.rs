use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

use num_traits::Float;

/// Scalar abstraction for the balance equations.
///
/// Every right-hand-side expression in this crate is written against this
/// trait so that the same code can be evaluated with plain [`f64`] values
/// during integration and with first-order dual numbers when the `autodiff`
/// feature supplies a forward-mode jacobian backend. Comparisons and
/// branch selection always go through [`Real::value`], so dual evaluation
/// follows the same branch as the real evaluation at the same point.
pub trait Real:
    Copy
    + Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    fn from_f64(value: f64) -> Self;

    /// The real part; any derivative information is dropped.
    fn value(self) -> f64;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }

    fn abs(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn powi(self, n: i32) -> Self;
    fn powf(self, n: f64) -> Self;

    /// Power with a scalar exponent, so that exponents that are themselves
    /// estimated parameters carry their derivative through.
    ///
    /// A zero base maps to zero for positive exponents and one otherwise,
    /// matching `0^n` for floats.
    fn pow(self, n: Self) -> Self {
        if self.value() == 0.0 {
            if n.value() > 0.0 {
                Self::zero()
            } else {
                Self::one()
            }
        } else {
            (n * self.ln()).exp()
        }
    }

    /// Maximum by real part.
    fn max(self, other: Self) -> Self {
        if self.value() >= other.value() {
            self
        } else {
            other
        }
    }
}

impl Real for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }

    fn value(self) -> f64 {
        self
    }

    fn abs(self) -> Self {
        Float::abs(self)
    }

    fn exp(self) -> Self {
        Float::exp(self)
    }

    fn ln(self) -> Self {
        Float::ln(self)
    }

    fn sqrt(self) -> Self {
        Float::sqrt(self)
    }

    fn powi(self, n: i32) -> Self {
        Float::powi(self, n)
    }

    fn powf(self, n: f64) -> Self {
        Float::powf(self, n)
    }

    fn pow(self, n: Self) -> Self {
        Float::powf(self, n)
    }
}

#[cfg(feature = "autodiff")]
impl Real for num_dual::Dual64 {
    fn from_f64(value: f64) -> Self {
        num_dual::Dual64::from(value)
    }

    fn value(self) -> f64 {
        self.re
    }

    fn abs(self) -> Self {
        if self.re < 0.0 {
            -self
        } else {
            self
        }
    }

    fn exp(self) -> Self {
        num_dual::DualNum::exp(&self)
    }

    fn ln(self) -> Self {
        num_dual::DualNum::ln(&self)
    }

    fn sqrt(self) -> Self {
        num_dual::DualNum::sqrt(&self)
    }

    fn powi(self, n: i32) -> Self {
        num_dual::DualNum::powi(&self, n)
    }

    fn powf(self, n: f64) -> Self {
        num_dual::DualNum::powf(&self, n)
    }
}
