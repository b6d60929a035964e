//! A module for radial profiles `k(r)` of stationary kernels.
//!
//! A radial profile maps a scaled distance `r` to a covariance value and gives
//! the derivatives with respect to `r` which are chained later on into
//! hyperparameters gradients. Only the squared exponential profile (RBF,
//! aka Gaussian kernel) is implemented.

use linfa::Float;
use ndarray::{Array2, ArrayBase, Data, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// A trait for the radial part of a stationary covariance function
pub trait RadialProfile<F: Float>: Clone + Copy + Default + fmt::Display + Sync {
    /// Covariance value `k(r)` for a scaled distance `r >= 0`
    fn k_of_r(&self, r: F, variance: F) -> F;

    /// First derivative `dk/dr`
    fn dk_dr(&self, r: F, variance: F) -> F;

    /// Second derivative `d2k/dr2`
    fn dk2_drdr(&self, r: F, variance: F) -> F;

    /// Second derivative on the diagonal where `r` is identically zero
    fn dk2_drdr_diag(&self, variance: F) -> F;

    /// Elementwise `k(r)` over a matrix of scaled distances
    fn k_of_r_matrix(&self, r: &ArrayBase<impl Data<Elem = F>, Ix2>, variance: F) -> Array2<F> {
        r.mapv(|v| self.k_of_r(v, variance))
    }

    /// Elementwise `dk/dr` over a matrix of scaled distances
    fn dk_dr_matrix(&self, r: &ArrayBase<impl Data<Elem = F>, Ix2>, variance: F) -> Array2<F> {
        r.mapv(|v| self.dk_dr(v, variance))
    }

    /// Elementwise `d2k/dr2` over a matrix of scaled distances
    fn dk2_drdr_matrix(&self, r: &ArrayBase<impl Data<Elem = F>, Ix2>, variance: F) -> Array2<F> {
        r.mapv(|v| self.dk2_drdr(v, variance))
    }
}

/// Squared exponential radial profile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct SquaredExponential();

impl From<SquaredExponential> for String {
    fn from(_item: SquaredExponential) -> String {
        "SquaredExponential".to_string()
    }
}

impl TryFrom<String> for SquaredExponential {
    type Error = &'static str;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "SquaredExponential" {
            Ok(Self::default())
        } else {
            Err("Bad string value for SquaredExponential, should be \'SquaredExponential\'")
        }
    }
}

impl<F: Float> RadialProfile<F> for SquaredExponential {
    /// k(r) = variance * exp(-r^2 / 2)
    fn k_of_r(&self, r: F, variance: F) -> F {
        variance * F::exp(F::cast(-0.5) * r * r)
    }

    /// dk/dr = -r * k(r)
    fn dk_dr(&self, r: F, variance: F) -> F {
        -r * self.k_of_r(r, variance)
    }

    /// d2k/dr2 = (r^2 - 1) * k(r)
    fn dk2_drdr(&self, r: F, variance: F) -> F {
        (r * r - F::one()) * self.k_of_r(r, variance)
    }

    fn dk2_drdr_diag(&self, variance: F) -> F {
        -variance
    }
}

impl fmt::Display for SquaredExponential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SquaredExponential")
    }
}
