//! This library implements the RBF covariance function, also known as squared exponential,
//! exponentiated quadratic or Gaussian kernel, used in [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! regression models:
//!
//! `k(x, x') = variance * exp(-r^2 / 2)` with `r` the distance between `x` and `x'` scaled by a lengthscale.
//!
//! Besides the plain RBF kernel on feature vectors, two kernel-kernel variants
//! are provided where inputs are models compared either with a named metric
//! ([`DistanceMetric`]) or through a precomputed model-to-model distance table
//! ([`DistanceBuilder`]).
//!
//! Kernels are implemented by [RbfKernel] parameterized by [RbfParams]. They provide
//! covariance matrices, derivatives with respect to the scaled distance, hyperparameters
//! gradients (optionally through an inverse squared lengthscale parameterization)
//! and forward psi statistics computations to a [`PsiComputer`].
//!
//! ```
//! use egobox_kernels::RbfKernel;
//! use ndarray::array;
//!
//! let mut kernel = RbfKernel::<f64>::params(2)
//!     .ard(true)
//!     .lengthscale(array![1., 2.])
//!     .build()
//!     .expect("RBF kernel");
//! let x = array![[0., 0.], [1., 2.], [3., 1.]];
//! let k = kernel.k(&x.view(), None).expect("covariance");
//!
//! // gradients of sum(K) with respect to variance and lengthscales
//! let dl_dk = ndarray::Array2::ones(k.dim());
//! kernel.reset_gradients();
//! kernel.update_gradients_full(&dl_dk.view(), &x.view(), None).expect("gradients");
//! assert_eq!(kernel.optimizer_gradient().len(), 3);
//! ```
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod cache;
pub mod distances;
mod errors;
mod hyperparameters;
mod kernel;
mod parameters;
pub mod psi;
pub mod radial;
mod serialization;
pub mod transforms;

pub use cache::{CacheKey, ScaledDistanceCache, DISTANCE_CACHE_LIMIT};
pub use distances::{
    DistanceBuilder, DistanceComputer, DistanceMetric, MetricArg, MetricKwargs,
    PrecomputedDistances,
};
pub use errors::*;
pub use hyperparameters::*;
pub use kernel::*;
pub use parameters::*;
pub use psi::{Psi2, PsiComputer, PsiDerivatives, PsiStatistics, VariationalPosterior};
pub use serialization::*;

/// Environment variable controlling log level of binaries using this library
/// (benches, demos), ex: `EGOBOX_LOG=debug`
pub const EGOBOX_LOG: &str = "EGOBOX_LOG";
