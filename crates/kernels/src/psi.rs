//! Psi statistics collaborators.
//!
//! Psi statistics are expectations of kernel values under a variational
//! distribution of the inputs, used by sparse variational GP models.
//! Kernels do not compute them: they forward calls to a [`PsiComputer`]
//! selected at construction (CPU or GPU backed).

use crate::errors::Result;
use crate::kernel::RbfKernel;
use linfa::Float;
use ndarray::{Array1, Array2, Array3};

/// Gaussian variational distribution `q(X)` of the inputs
#[derive(Clone, Debug, PartialEq)]
pub struct VariationalPosterior<F: Float> {
    /// Means (n, nx)
    pub mean: Array2<F>,
    /// Variances (n, nx)
    pub variance: Array2<F>,
}

impl<F: Float> VariationalPosterior<F> {
    /// Constructor
    pub fn new(mean: Array2<F>, variance: Array2<F>) -> Self {
        VariationalPosterior { mean, variance }
    }
}

/// Second order psi statistic layouts
#[derive(Clone, Debug, PartialEq)]
pub enum Psi2<F: Float> {
    /// Summed over data points (m, m)
    Summed(Array2<F>),
    /// One (m, m) matrix per data point (n, m, m)
    PerPoint(Array3<F>),
}

/// Psi statistics of a kernel
#[derive(Clone, Debug, PartialEq)]
pub struct PsiStatistics<F: Float> {
    /// psi0 (n,)
    pub psi0: Array1<F>,
    /// psi1 (n, m)
    pub psi1: Array2<F>,
    /// psi2 in the requested layout
    pub psi2: Psi2<F>,
}

/// Derivatives of an objective through psi statistics
#[derive(Clone, Debug, PartialEq)]
pub struct PsiDerivatives<F: Float> {
    /// dL/dvariance
    pub dvariance: F,
    /// dL/dlengthscale
    pub dlengthscale: Array1<F>,
    /// dL/dZ (m, nx)
    pub dz: Array2<F>,
    /// dL/dmu of q(X) (n, nx)
    pub dmu: Array2<F>,
    /// dL/dS of q(X) (n, nx)
    pub ds: Array2<F>,
}

/// Computer of the psi statistics of an RBF kernel
pub trait PsiComputer<F: Float>: Send + Sync {
    /// Compute `(psi0, psi1, psi2)` given inducing inputs `z` and `q(X)`,
    /// psi2 per data point when `return_psi2_n` is true.
    fn psi_computations(
        &self,
        kernel: &RbfKernel<F>,
        z: &Array2<F>,
        posterior: &VariationalPosterior<F>,
        return_psi2_n: bool,
    ) -> Result<PsiStatistics<F>>;

    /// Chain objective derivatives with respect to psi statistics into
    /// kernel hyperparameters, inducing inputs and `q(X)` parameters
    fn psi_derivative_computations(
        &self,
        kernel: &RbfKernel<F>,
        dl_dpsi0: &Array1<F>,
        dl_dpsi1: &Array2<F>,
        dl_dpsi2: &Psi2<F>,
        z: &Array2<F>,
        posterior: &VariationalPosterior<F>,
    ) -> Result<PsiDerivatives<F>>;
}
