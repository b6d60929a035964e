use crate::cache::{CacheKey, ScaledDistanceCache};
use crate::distances::{DistanceBuilder, DistanceComputer, DistanceMetric};
use crate::errors::{KernelError, Result};
use crate::hyperparameters::Hyperparameters;
use crate::parameters::{RbfParams, RbfValidParams};
use crate::psi::{Psi2, PsiComputer, VariationalPosterior};
use crate::radial::{RadialProfile, SquaredExponential};

use linfa::Float;
use log::{debug, warn};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, CowArray, Ix2, Zip};
use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Class identifier of the plain RBF kernel
pub const RBF_CLASS: &str = "GPy.kern.RBF";
/// Class identifier of the metric based kernel-kernel
pub const RBF_KERNEL_KERNEL_CLASS: &str = "GPy.kern.RBFKernelKernel";
/// Class identifier of the distance builder based kernel-kernel
pub const RBF_DB_KERNEL_KERNEL_CLASS: &str = "GPy.kern.RBFDistanceBuilderKernelKernel";

/// Radial basis function kernel, aka squared exponential, exponentiated quadratic
/// or Gaussian kernel:
///
/// `k(r) = variance * exp(-r^2 / 2)`
///
/// where `r` is the distance between inputs scaled by the lengthscale.
///
/// Three variants are available depending on the distance backend:
/// * plain RBF on feature vectors with euclidean distance, built with [`RbfKernel::params`],
///   lengthscales can be set per component (ARD),
/// * kernel-kernel on feature vectors compared with a named metric,
///   built with [`RbfKernel::kernel_kernel_params`],
/// * kernel-kernel on model indices looking up a precomputed distance table,
///   built with [`RbfKernel::distance_builder_params`].
///
/// Kernel-kernels always divide distances by a single lengthscale: requesting
/// ARD on them has no effect.
///
/// # Evaluation cycle
///
/// Between two optimizer iterations hyperparameters are set (see
/// [`RbfKernel::set_optimizer_array`]), gradient slots are reset with
/// [`RbfKernel::reset_gradients`], then the `update_gradients_*` methods
/// accumulate `dL/dvariance` and `dL/dlengthscale` given `dL/dK`.
/// When the kernel is built with `inv_l`, `dL/dinv_lengthscale` is then
/// (re)computed from the lengthscale gradient.
///
/// Scaled distances are memoized on the identity of the inputs,
/// a lengthscale change or a distance table change invalidates them.
///
/// # Example
///
/// ```
/// use egobox_kernels::RbfKernel;
/// use ndarray::array;
///
/// let kernel = RbfKernel::<f64>::params(1)
///     .variance(2.)
///     .build()
///     .expect("RBF kernel");
/// let x = array![[0.], [1.]];
/// let k = kernel.k(&x.view(), None).expect("covariance");
/// assert_eq!(k[[0, 0]], 2.);
/// ```
#[derive(Clone)]
pub struct RbfKernel<F: Float> {
    /// Number of input components seen by the kernel
    input_dim: usize,
    /// Automatic relevance determination flag
    ard: bool,
    /// Input columns the kernel works on
    active_dims: Option<Vec<usize>>,
    /// Kernel name
    name: String,
    /// Psi statistics computed with the GPU computer
    use_gpu: bool,
    /// Variance and lengthscale
    hyper: Hyperparameters<F>,
    /// Radial profile k(r)
    profile: SquaredExponential,
    /// Unscaled distance backend
    distance: DistanceComputer<F>,
    /// Psi statistics computer selected at construction
    psi_computer: Option<Arc<dyn PsiComputer<F>>>,
    /// Memoized scaled distances
    cache: ScaledDistanceCache<F>,
}

impl<F: Float> fmt::Debug for RbfKernel<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RbfKernel")
            .field("name", &self.name)
            .field("input_dim", &self.input_dim)
            .field("ard", &self.ard)
            .field("active_dims", &self.active_dims)
            .field("use_gpu", &self.use_gpu)
            .field("hyper", &self.hyper)
            .field("distance", &self.distance)
            .finish()
    }
}

impl<F: Float> fmt::Display for RbfKernel<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}(name={}, variance={}, lengthscale={}, inv_l={})",
            self.class_name(),
            self.name,
            self.variance(),
            self.lengthscale(),
            self.use_inv_lengthscale()
        )
    }
}

impl<F: Float> RbfKernel<F> {
    /// Plain RBF kernel parameters constructor
    pub fn params(input_dim: usize) -> RbfParams<F> {
        RbfParams::new(input_dim)
    }

    /// Metric based kernel-kernel parameters constructor
    pub fn kernel_kernel_params(metric: DistanceMetric<F>) -> RbfParams<F> {
        RbfParams::kernel_kernel(metric)
    }

    /// Distance builder based kernel-kernel parameters constructor
    pub fn distance_builder_params(
        builder: Arc<dyn DistanceBuilder<F>>,
        n_models: usize,
    ) -> RbfParams<F> {
        RbfParams::distance_builder(builder, n_models)
    }

    /// Build a kernel from validated parameters
    pub fn new(params: RbfValidParams<F>) -> Self {
        let hyper = Hyperparameters::new(params.variance(), params.lengthscale(), params.inv_l());
        let psi_computer = if params.use_gpu() {
            params.gpu_psi_computer.clone()
        } else {
            params.psi_computer.clone()
        };
        let kernel = RbfKernel {
            input_dim: params.input_dim(),
            ard: params.ard(),
            active_dims: params.active_dims().cloned(),
            name: params.name(),
            use_gpu: params.use_gpu(),
            hyper,
            profile: SquaredExponential::default(),
            distance: params.distance().clone(),
            psi_computer,
            cache: ScaledDistanceCache::new(params.cache_limit()),
        };
        debug!("Kernel built: {}", kernel);
        kernel
    }

    /// Class identifier of the kernel variant
    pub fn class_name(&self) -> &'static str {
        match self.distance {
            DistanceComputer::Euclidean => RBF_CLASS,
            DistanceComputer::Metric(_) => RBF_KERNEL_KERNEL_CLASS,
            DistanceComputer::Lookup { .. } => RBF_DB_KERNEL_KERNEL_CLASS,
        }
    }

    /// Kernel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of input components seen by the kernel
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Automatic relevance determination flag
    pub fn ard(&self) -> bool {
        self.ard
    }

    /// Input columns the kernel works on
    pub fn active_dims(&self) -> Option<&Vec<usize>> {
        self.active_dims.as_ref()
    }

    /// Whether psi statistics are delegated to the GPU computer
    pub fn use_gpu(&self) -> bool {
        self.use_gpu
    }

    /// Whether inverse lengthscale parameterization is active
    pub fn use_inv_lengthscale(&self) -> bool {
        self.hyper.use_inv_lengthscale()
    }

    /// Distance backend
    pub fn distance(&self) -> &DistanceComputer<F> {
        &self.distance
    }

    /// Hyperparameters with their gradients
    pub fn hyperparameters(&self) -> &Hyperparameters<F> {
        &self.hyper
    }

    /// Current variance
    pub fn variance(&self) -> F {
        self.hyper.variance_value()
    }

    /// Current lengthscale
    pub fn lengthscale(&self) -> &Array1<F> {
        self.hyper.lengthscale().value()
    }

    /// Current `1 / lengthscale^2` when inverse parameterization is active
    pub fn inv_lengthscale(&self) -> Option<&Array1<F>> {
        self.hyper.inv_lengthscale().map(|p| p.value())
    }

    /// Number of memoized scaled distance matrices
    pub fn cached_distances(&self) -> usize {
        self.cache.len()
    }

    /// Set variance
    pub fn set_variance(&mut self, variance: F) -> Result<()> {
        self.hyper.set_variance(variance)
    }

    /// Set lengthscale (`inv_l` is updated accordingly in inverse mode)
    pub fn set_lengthscale(&mut self, lengthscale: Array1<F>) -> Result<()> {
        self.hyper.set_lengthscale(lengthscale)
    }

    /// Set `1 / lengthscale^2`, only valid in inverse mode
    pub fn set_inv_lengthscale(&mut self, inv_l: Array1<F>) -> Result<()> {
        self.hyper.set_inv_lengthscale(inv_l)
    }

    /// Names of the parameters exposed to an optimizer
    pub fn parameter_names(&self) -> Vec<&str> {
        self.hyper.parameter_names()
    }

    /// Optimized parameters values, variance first
    pub fn param_array(&self) -> Array1<F> {
        self.hyper.param_array()
    }

    /// Set optimized parameters values, variance first
    pub fn set_param_array(&mut self, values: &Array1<F>) -> Result<()> {
        self.hyper.set_param_array(values)
    }

    /// Optimized parameters in unconstrained (Logexp) space
    pub fn optimizer_array(&self) -> Array1<F> {
        self.hyper.optimizer_array()
    }

    /// Set optimized parameters from unconstrained (Logexp) space
    pub fn set_optimizer_array(&mut self, values: &Array1<F>) -> Result<()> {
        self.hyper.set_optimizer_array(values)
    }

    /// Gradient of the optimized parameters in unconstrained (Logexp) space
    pub fn optimizer_gradient(&self) -> Array1<F> {
        self.hyper.optimizer_gradient()
    }

    /// Zero gradient slots before a new evaluation cycle
    pub fn reset_gradients(&mut self) {
        self.hyper.reset_gradients()
    }

    /// Check `x` width and restrict it to the active dimensions
    fn active_inputs<'a>(&self, x: &'a ArrayView2<F>) -> Result<CowArray<'a, F, Ix2>> {
        match &self.active_dims {
            Some(dims) => {
                if let Some(d) = dims.iter().find(|d| **d >= x.ncols()) {
                    return Err(KernelError::ShapeMismatch(format!(
                        "active dimension {} out of inputs with {} columns",
                        d,
                        x.ncols()
                    )));
                }
                Ok(CowArray::from(x.select(Axis(1), dims)))
            }
            None => {
                if x.ncols() != self.input_dim {
                    return Err(KernelError::ShapeMismatch(format!(
                        "inputs with {} columns given, expected {}",
                        x.ncols(),
                        self.input_dim
                    )));
                }
                Ok(CowArray::from(x.view()))
            }
        }
    }

    /// Unscaled distances between rows of `x` and `x2` (`x` when `None`)
    pub fn unscaled_distance(
        &self,
        x: &ArrayView2<F>,
        x2: Option<&ArrayView2<F>>,
    ) -> Result<Array2<F>> {
        let xa = self.active_inputs(x)?;
        let x2a = x2.map(|v| self.active_inputs(v)).transpose()?;
        let x2v = x2a.as_ref().map(|v| v.view());
        self.distance.unscaled_distance(&xa.view(), x2v.as_ref())
    }

    /// Distances scaled by the lengthscale, memoized on `(x, x2)` identity
    pub fn scaled_distance(
        &self,
        x: &ArrayView2<F>,
        x2: Option<&ArrayView2<F>>,
    ) -> Result<Array2<F>> {
        let key = CacheKey::new(
            self.hyper.generation(),
            self.distance.builder_generation(),
            x,
            x2,
        );
        self.cache.get_or_compute(key, x, x2, || {
            let xa = self.active_inputs(x)?;
            let x2a = x2.map(|v| self.active_inputs(v)).transpose()?;
            let x2v = x2a.as_ref().map(|v| v.view());
            self.distance
                .scaled_distance(&xa.view(), x2v.as_ref(), self.lengthscale(), self.ard)
        })
    }

    /// Covariance values `k(r)` for given scaled distances
    pub fn k_of_r(&self, r: &Array2<F>) -> Array2<F> {
        self.profile.k_of_r_matrix(r, self.variance())
    }

    /// `dk/dr` for given scaled distances
    pub fn dk_dr(&self, r: &Array2<F>) -> Array2<F> {
        self.profile.dk_dr_matrix(r, self.variance())
    }

    /// `d2k/dr2` for given scaled distances
    pub fn dk2_drdr(&self, r: &Array2<F>) -> Array2<F> {
        self.profile.dk2_drdr_matrix(r, self.variance())
    }

    /// `d2k/dr2` on the diagonal (where `r = 0`)
    pub fn dk2_drdr_diag(&self) -> F {
        self.profile.dk2_drdr_diag(self.variance())
    }

    /// Covariance matrix between rows of `x` and `x2` (`x` when `None`)
    pub fn k(&self, x: &ArrayView2<F>, x2: Option<&ArrayView2<F>>) -> Result<Array2<F>> {
        let r = self.scaled_distance(x, x2)?;
        Ok(self.k_of_r(&r))
    }

    /// Diagonal of the covariance matrix of `x`
    pub fn k_diag(&self, x: &ArrayView2<F>) -> Result<Array1<F>> {
        self.active_inputs(x)?;
        Ok(Array1::from_elem(x.nrows(), self.variance()))
    }

    /// `dk/dr` evaluated at the scaled distances between `x` and `x2`
    pub fn dk_dr_via_x(&self, x: &ArrayView2<F>, x2: Option<&ArrayView2<F>>) -> Result<Array2<F>> {
        let r = self.scaled_distance(x, x2)?;
        Ok(self.dk_dr(&r))
    }

    /// `d2k/dr2` evaluated at the scaled distances between `x` and `x2`
    pub fn dk2_drdr_via_x(
        &self,
        x: &ArrayView2<F>,
        x2: Option<&ArrayView2<F>>,
    ) -> Result<Array2<F>> {
        let r = self.scaled_distance(x, x2)?;
        Ok(self.dk2_drdr(&r))
    }

    fn check_dl_dk(&self, dl_dk: &ArrayView2<F>, r: &Array2<F>) -> Result<()> {
        if dl_dk.dim() != r.dim() {
            return Err(KernelError::ShapeMismatch(format!(
                "dL_dK of shape {:?} given, expected {:?}",
                dl_dk.dim(),
                r.dim()
            )));
        }
        Ok(())
    }

    /// Accumulate hyperparameters gradients given `dl_dk`, the gradient of an
    /// objective with respect to `K(x, x2)`.
    pub fn update_gradients_full(
        &mut self,
        dl_dk: &ArrayView2<F>,
        x: &ArrayView2<F>,
        x2: Option<&ArrayView2<F>>,
    ) -> Result<()> {
        let now = Instant::now();
        let r = self.scaled_distance(x, x2)?;
        self.check_dl_dk(dl_dk, &r)?;
        let variance = self.variance();

        let dvariance = (&self.k_of_r(&r) * dl_dk).sum() / variance;
        let dl_dr = &self.dk_dr(&r) * dl_dk;

        let dlengthscale = match self.distance {
            DistanceComputer::Euclidean if self.ard => {
                let xa = self.active_inputs(x)?.into_owned();
                let x2a = match x2 {
                    Some(v) => self.active_inputs(v)?.into_owned(),
                    None => xa.to_owned(),
                };
                let tmp = &dl_dr * &inv_dist(&r);
                let lengthscale = self.lengthscale();
                let grads: Vec<F> = (0..self.input_dim)
                    .into_par_iter()
                    .map(|q| {
                        let mut acc = F::zero();
                        Zip::indexed(&tmp).for_each(|(i, j), t| {
                            let d = xa[[i, q]] - x2a[[j, q]];
                            acc += *t * d * d;
                        });
                        let l = lengthscale[q];
                        -acc / (l * l * l)
                    })
                    .collect();
                Array1::from_vec(grads)
            }
            _ => {
                let l = self.lengthscale()[0];
                Array1::from_elem(1, -(&dl_dr * &r).sum() / l)
            }
        };

        self.hyper.add_variance_gradient(dvariance);
        self.hyper.add_lengthscale_gradient(&dlengthscale);
        self.hyper.project_inv_lengthscale_gradient();
        debug!(
            "{} full gradients updated in {} us",
            self.name,
            now.elapsed().as_micros()
        );
        Ok(())
    }

    /// Accumulate hyperparameters gradients given `dl_dkdiag`, the gradient of an
    /// objective with respect to the diagonal of `K(x, x)`.
    pub fn update_gradients_diag(
        &mut self,
        dl_dkdiag: &ArrayView1<F>,
        x: &ArrayView2<F>,
    ) -> Result<()> {
        self.active_inputs(x)?;
        if dl_dkdiag.len() != x.nrows() {
            return Err(KernelError::ShapeMismatch(format!(
                "dL_dKdiag of length {} given, expected {}",
                dl_dkdiag.len(),
                x.nrows()
            )));
        }
        // diagonal does not depend on lengthscale
        self.hyper.add_variance_gradient(dl_dkdiag.sum());
        self.hyper.project_inv_lengthscale_gradient();
        Ok(())
    }

    /// Gradient of `sum(dl_dk * K(x, x2))` with respect to `x`.
    ///
    /// Only defined for the plain RBF kernel, kernel-kernel inputs being
    /// identifiers. Columns outside of active dimensions get zero.
    pub fn gradients_x(
        &self,
        dl_dk: &ArrayView2<F>,
        x: &ArrayView2<F>,
        x2: Option<&ArrayView2<F>>,
    ) -> Result<Array2<F>> {
        if !matches!(self.distance, DistanceComputer::Euclidean) {
            return Err(KernelError::InvalidValueError(format!(
                "input gradients are not defined for {}",
                self.class_name()
            )));
        }
        let r = self.scaled_distance(x, x2)?;
        self.check_dl_dk(dl_dk, &r)?;
        let mut tmp = &inv_dist(&r) * &(&self.dk_dr(&r) * dl_dk);
        if x2.is_none() {
            tmp = &tmp + &tmp.t();
        }
        let xa = self.active_inputs(x)?;
        let x2a = match x2 {
            Some(v) => self.active_inputs(v)?,
            None => self.active_inputs(x)?,
        };
        let lengthscale = self.lengthscale();
        let mut grad = Array2::zeros((xa.nrows(), self.input_dim));
        Zip::indexed(&mut grad).for_each(|(i, q), g| {
            let l = if self.ard { lengthscale[q] } else { lengthscale[0] };
            let s = tmp
                .row(i)
                .iter()
                .zip(x2a.column(q).iter())
                .fold(F::zero(), |acc, (t, x2_jq)| acc + *t * (xa[[i, q]] - *x2_jq));
            *g = s / (l * l);
        });
        Ok(self.scatter_active(grad, x.ncols()))
    }

    /// Gradient of `sum(dl_dkdiag * Kdiag(x))` with respect to `x`, always zero
    pub fn gradients_x_diag(
        &self,
        dl_dkdiag: &ArrayView1<F>,
        x: &ArrayView2<F>,
    ) -> Result<Array2<F>> {
        self.active_inputs(x)?;
        if dl_dkdiag.len() != x.nrows() {
            return Err(KernelError::ShapeMismatch(format!(
                "dL_dKdiag of length {} given, expected {}",
                dl_dkdiag.len(),
                x.nrows()
            )));
        }
        Ok(Array2::zeros(x.dim()))
    }

    fn scatter_active(&self, grad: Array2<F>, ncols: usize) -> Array2<F> {
        match &self.active_dims {
            Some(dims) => {
                let mut full = Array2::zeros((grad.nrows(), ncols));
                for (k, d) in dims.iter().enumerate() {
                    let mut col = full.column_mut(*d);
                    col += &grad.column(k);
                }
                full
            }
            None => grad,
        }
    }

    /// Spectral density at frequencies `omega`, only for one dimensional inputs
    pub fn spectrum(&self, omega: &Array1<F>) -> Result<Array1<F>> {
        if self.input_dim != 1 {
            return Err(KernelError::InvalidValueError(format!(
                "spectrum is only available for `input_dim` = 1, got {}",
                self.input_dim
            )));
        }
        let l = self.lengthscale()[0];
        let factor = self.variance() * F::cast(2. * std::f64::consts::PI).sqrt() * l;
        Ok(omega.mapv(|w| factor * F::exp(-l * w * w)))
    }

    fn psi_computer(&self) -> Result<Arc<dyn PsiComputer<F>>> {
        match &self.psi_computer {
            Some(c) => Ok(c.clone()),
            None => {
                warn!("Psi statistics requested on kernel '{}' without computer", self.name);
                Err(KernelError::MissingPsiComputer(self.name.to_string()))
            }
        }
    }

    /// psi0 statistic
    pub fn psi0(&self, z: &Array2<F>, posterior: &VariationalPosterior<F>) -> Result<Array1<F>> {
        let stats = self
            .psi_computer()?
            .psi_computations(self, z, posterior, false)?;
        Ok(stats.psi0)
    }

    /// psi1 statistic
    pub fn psi1(&self, z: &Array2<F>, posterior: &VariationalPosterior<F>) -> Result<Array2<F>> {
        let stats = self
            .psi_computer()?
            .psi_computations(self, z, posterior, false)?;
        Ok(stats.psi1)
    }

    /// psi2 statistic summed over data points
    pub fn psi2(&self, z: &Array2<F>, posterior: &VariationalPosterior<F>) -> Result<Array2<F>> {
        let stats = self
            .psi_computer()?
            .psi_computations(self, z, posterior, false)?;
        match stats.psi2 {
            Psi2::Summed(psi2) => Ok(psi2),
            Psi2::PerPoint(psi2n) => Ok(psi2n.sum_axis(Axis(0))),
        }
    }

    /// psi2 statistic per data point
    pub fn psi2n(&self, z: &Array2<F>, posterior: &VariationalPosterior<F>) -> Result<Array3<F>> {
        let stats = self
            .psi_computer()?
            .psi_computations(self, z, posterior, true)?;
        match stats.psi2 {
            Psi2::PerPoint(psi2n) => Ok(psi2n),
            Psi2::Summed(_) => Err(KernelError::ShapeMismatch(
                "psi statistics computer returned summed psi2 where per point psi2 was requested"
                    .to_string(),
            )),
        }
    }

    /// Set hyperparameters gradients from objective derivatives with respect
    /// to psi statistics (overwrites variance and lengthscale gradients)
    pub fn update_gradients_expectations(
        &mut self,
        dl_dpsi0: &Array1<F>,
        dl_dpsi1: &Array2<F>,
        dl_dpsi2: &Psi2<F>,
        z: &Array2<F>,
        posterior: &VariationalPosterior<F>,
    ) -> Result<()> {
        let derivatives = self.psi_computer()?.psi_derivative_computations(
            self, dl_dpsi0, dl_dpsi1, dl_dpsi2, z, posterior,
        )?;
        if derivatives.dlengthscale.len() != self.lengthscale().len() {
            return Err(KernelError::ShapeMismatch(format!(
                "lengthscale gradient of length {} given, expected {}",
                derivatives.dlengthscale.len(),
                self.lengthscale().len()
            )));
        }
        self.hyper
            .set_gradients(derivatives.dvariance, derivatives.dlengthscale);
        self.hyper.project_inv_lengthscale_gradient();
        Ok(())
    }

    /// Gradient of the objective with respect to inducing inputs `z`
    pub fn gradients_z_expectations(
        &self,
        dl_dpsi0: &Array1<F>,
        dl_dpsi1: &Array2<F>,
        dl_dpsi2: &Psi2<F>,
        z: &Array2<F>,
        posterior: &VariationalPosterior<F>,
    ) -> Result<Array2<F>> {
        let derivatives = self.psi_computer()?.psi_derivative_computations(
            self, dl_dpsi0, dl_dpsi1, dl_dpsi2, z, posterior,
        )?;
        Ok(derivatives.dz)
    }

    /// Gradients of the objective with respect to `q(X)` means and variances
    pub fn gradients_qx_expectations(
        &self,
        dl_dpsi0: &Array1<F>,
        dl_dpsi1: &Array2<F>,
        dl_dpsi2: &Psi2<F>,
        z: &Array2<F>,
        posterior: &VariationalPosterior<F>,
    ) -> Result<(Array2<F>, Array2<F>)> {
        let derivatives = self.psi_computer()?.psi_derivative_computations(
            self, dl_dpsi0, dl_dpsi1, dl_dpsi2, z, posterior,
        )?;
        Ok((derivatives.dmu, derivatives.ds))
    }
}

/// Elementwise `1 / r`, zero where `r` is zero
fn inv_dist<F: Float>(r: &Array2<F>) -> Array2<F> {
    r.mapv(|v| if v == F::zero() { F::zero() } else { F::one() / v })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distances::{MetricArg, MetricKwargs, PrecomputedDistances};
    use crate::psi::{PsiDerivatives, PsiStatistics};
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::{array, Array};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use paste::paste;
    use rand_xoshiro::Xoshiro256Plus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn random_matrix(shape: (usize, usize), seed: u64) -> Array2<f64> {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        Array2::random_using(shape, Uniform::new(-1., 1.), &mut rng)
    }

    fn table4() -> Array2<f64> {
        array![
            [0., 1., 2., 3.],
            [1., 0., 4., 5.],
            [2., 4., 0., 6.],
            [3., 5., 6., 0.]
        ]
    }

    #[test]
    fn test_rbf_two_points() {
        let kernel = RbfKernel::<f64>::params(1)
            .variance(2.)
            .lengthscale(array![1.])
            .build()
            .unwrap();
        let x = array![[0.0], [1.0]];
        let k = kernel.k(&x.view(), None).unwrap();
        let e = 2. * f64::exp(-0.5);
        assert_abs_diff_eq!(k, array![[2., e], [e, 2.]], epsilon = 1e-12);
        assert_eq!(kernel.k_diag(&x.view()).unwrap(), array![2., 2.]);
        assert_eq!(kernel.class_name(), RBF_CLASS);
        assert_eq!(kernel.name(), "rbf");
    }

    #[test]
    fn test_scaled_distance_homogeneous_in_lengthscale() {
        let x = random_matrix((5, 2), 0);
        let mut kernel = RbfKernel::<f64>::params(2).build().unwrap();
        let r1 = kernel.scaled_distance(&x.view(), None).unwrap();
        kernel.set_lengthscale(array![4.]).unwrap();
        let r4 = kernel.scaled_distance(&x.view(), None).unwrap();
        assert_abs_diff_eq!(r1 / 4., r4, epsilon = 1e-12);
    }

    #[test]
    fn test_cache_transparency_and_invalidation() {
        let x = random_matrix((6, 3), 1);
        let x2 = random_matrix((4, 3), 2);
        let mut kernel = RbfKernel::<f64>::params(3).build().unwrap();
        let a = kernel.scaled_distance(&x.view(), Some(&x2.view())).unwrap();
        assert_eq!(kernel.cached_distances(), 1);
        let b = kernel.scaled_distance(&x.view(), Some(&x2.view())).unwrap();
        assert_eq!(kernel.cached_distances(), 1);
        assert_eq!(a, b);
        let fresh = RbfKernel::<f64>::params(3).build().unwrap();
        assert_eq!(
            fresh.scaled_distance(&x.view(), Some(&x2.view())).unwrap(),
            a
        );

        kernel.set_lengthscale(array![2.]).unwrap();
        let c = kernel.scaled_distance(&x.view(), Some(&x2.view())).unwrap();
        assert_ne!(a, c);
        assert_abs_diff_eq!(a / 2., c, epsilon = 1e-12);
    }

    #[test]
    fn test_cache_invalidated_by_distance_table_update() {
        let builder = Arc::new(PrecomputedDistances::new(table4()));
        let kernel = RbfKernel::distance_builder_params(builder.clone(), 4)
            .build()
            .unwrap();
        let x = array![[0.], [1.]];
        let r = kernel.scaled_distance(&x.view(), None).unwrap();
        assert_eq!(r, array![[0., 1.], [1., 0.]]);
        builder.update(table4() * 3.);
        let r = kernel.scaled_distance(&x.view(), None).unwrap();
        assert_eq!(r, array![[0., 3.], [3., 0.]]);
    }

    #[test]
    fn test_distance_builder_lookup() {
        let builder = Arc::new(PrecomputedDistances::new(table4()));
        let kernel = RbfKernel::distance_builder_params(builder, 4)
            .lengthscale(array![2.])
            .build()
            .unwrap();
        assert_eq!(kernel.class_name(), RBF_DB_KERNEL_KERNEL_CLASS);
        let x = array![[0.], [2.]];
        let x2 = array![[1.], [3.]];
        let d = kernel.unscaled_distance(&x.view(), Some(&x2.view())).unwrap();
        let expected = table4()
            .select(Axis(0), &[0, 2])
            .select(Axis(1), &[1, 3]);
        assert_eq!(d, expected);
        let r = kernel.scaled_distance(&x.view(), Some(&x2.view())).unwrap();
        assert_eq!(r, expected / 2.);

        let bad = array![[5.]];
        assert!(matches!(
            kernel.k(&bad.view(), Some(&x2.view())),
            Err(KernelError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_distance_builder_requires_input_dim_one() {
        let builder = Arc::new(PrecomputedDistances::new(table4()));
        let res = RbfKernel::distance_builder_params(builder, 4)
            .input_dim(2)
            .build();
        assert!(matches!(res, Err(KernelError::InvalidValueError(_))));
    }

    #[test]
    fn test_kernel_kernel_metric() {
        let mut kwargs = MetricKwargs::new();
        kwargs.insert("p".to_string(), MetricArg::Scalar(1.));
        let metric = DistanceMetric::from_name("minkowski", &kwargs).unwrap();
        let kernel = RbfKernel::kernel_kernel_params(metric)
            .input_dim(2)
            .lengthscale(array![0.5])
            .build()
            .unwrap();
        assert_eq!(kernel.class_name(), RBF_KERNEL_KERNEL_CLASS);
        assert_eq!(kernel.name(), "kernel_kernel");
        let x = array![[0., 0.], [1., 2.]];
        let r = kernel.scaled_distance(&x.view(), None).unwrap();
        assert_abs_diff_eq!(r, array![[0., 6.], [6., 0.]], epsilon = 1e-12);
    }

    /// ARD is accepted on kernel-kernels but lengthscale stays a single divisor
    #[test]
    fn test_kernel_kernel_ard_has_no_effect() {
        let builder = Arc::new(PrecomputedDistances::new(table4()));
        let x = array![[0.], [1.], [3.]];
        let plain = RbfKernel::distance_builder_params(builder.clone(), 4)
            .lengthscale(array![1.5])
            .build()
            .unwrap();
        let ard = RbfKernel::distance_builder_params(builder, 4)
            .lengthscale(array![1.5])
            .ard(true)
            .build()
            .unwrap();
        assert_eq!(
            plain.k(&x.view(), None).unwrap(),
            ard.k(&x.view(), None).unwrap()
        );
        assert_eq!(ard.lengthscale().len(), 1);
    }

    #[test]
    fn test_ard_rbf_scales_components() {
        let kernel = RbfKernel::<f64>::params(2)
            .ard(true)
            .lengthscale(array![1., 2.])
            .build()
            .unwrap();
        let x = array![[0., 0.], [3., 8.]];
        let r = kernel.scaled_distance(&x.view(), None).unwrap();
        assert_abs_diff_eq!(r[[0, 1]], 5., epsilon = 1e-12);
    }

    #[test]
    fn test_active_dims() {
        let kernel = RbfKernel::<f64>::params(1)
            .active_dims(vec![1])
            .build()
            .unwrap();
        let x = array![[100., 0.], [-3., 1.]];
        let k = kernel.k(&x.view(), None).unwrap();
        assert_abs_diff_eq!(k[[0, 1]], f64::exp(-0.5), epsilon = 1e-12);
        let narrow = array![[0.]];
        assert!(matches!(
            kernel.k(&narrow.view(), None),
            Err(KernelError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let mut kernel = RbfKernel::<f64>::params(2).build().unwrap();
        let x = array![[0.], [1.]];
        assert!(matches!(
            kernel.k(&x.view(), None),
            Err(KernelError::ShapeMismatch(_))
        ));
        let x = array![[0., 1.], [1., 0.]];
        let dl_dk = Array2::ones((3, 3));
        assert!(matches!(
            kernel.update_gradients_full(&dl_dk.view(), &x.view(), None),
            Err(KernelError::ShapeMismatch(_))
        ));
        let dl_dkdiag = Array1::ones(3);
        assert!(matches!(
            kernel.update_gradients_diag(&dl_dkdiag.view(), &x.view()),
            Err(KernelError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_inv_l_round_trip() {
        let mut kernel = RbfKernel::<f64>::params(1).inv_l(true).build().unwrap();
        assert_eq!(kernel.parameter_names(), vec!["variance", "inv_lengthscale"]);
        kernel.set_inv_lengthscale(array![0.16]).unwrap();
        assert_abs_diff_eq!(kernel.lengthscale()[0], 2.5, epsilon = 1e-12);
        let x = array![[0.], [1.]];
        let k = kernel.k(&x.view(), None).unwrap();
        assert_abs_diff_eq!(k[[0, 1]], f64::exp(-0.5 * 0.16), epsilon = 1e-12);
    }

    #[test]
    fn test_gradients_accumulate() {
        let x = random_matrix((4, 1), 3);
        let dl_dk = random_matrix((4, 4), 4);
        let mut kernel = RbfKernel::<f64>::params(1).build().unwrap();
        kernel
            .update_gradients_full(&dl_dk.view(), &x.view(), None)
            .unwrap();
        let once = kernel.hyperparameters().lengthscale().gradient().to_owned();
        let var_once = kernel.hyperparameters().variance().gradient()[0];
        kernel
            .update_gradients_full(&dl_dk.view(), &x.view(), None)
            .unwrap();
        assert_abs_diff_eq!(
            kernel.hyperparameters().lengthscale().gradient().to_owned(),
            &once * 2.,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            kernel.hyperparameters().variance().gradient()[0],
            2. * var_once,
            epsilon = 1e-12
        );
        kernel.reset_gradients();
        assert_eq!(kernel.hyperparameters().variance().gradient()[0], 0.);
    }

    #[test]
    fn test_gradients_diag() {
        let x = random_matrix((3, 2), 5);
        let mut kernel = RbfKernel::<f64>::params(2).inv_l(true).build().unwrap();
        let dl_dkdiag = array![1., 2., 3.];
        kernel
            .update_gradients_diag(&dl_dkdiag.view(), &x.view())
            .unwrap();
        let h = kernel.hyperparameters();
        assert_eq!(h.variance().gradient()[0], 6.);
        assert_eq!(h.lengthscale().gradient()[0], 0.);
        assert_eq!(h.inv_lengthscale().unwrap().gradient()[0], 0.);
        assert_eq!(
            kernel.gradients_x_diag(&dl_dkdiag.view(), &x.view()).unwrap(),
            Array2::<f64>::zeros((3, 2))
        );
    }

    fn objective(
        kernel: &RbfKernel<f64>,
        x: &Array2<f64>,
        x2: Option<&Array2<f64>>,
        w: &Array2<f64>,
    ) -> f64 {
        let x2v = x2.map(|v| v.view());
        (kernel.k(&x.view(), x2v.as_ref()).unwrap() * w).sum()
    }

    fn check_param_gradients(kernel: RbfKernel<f64>, x: Array2<f64>, x2: Option<Array2<f64>>) {
        let n2 = x2.as_ref().map(|v| v.nrows()).unwrap_or(x.nrows());
        let w = random_matrix((x.nrows(), n2), 42);
        let mut kernel = kernel;
        kernel.reset_gradients();
        let x2v = x2.as_ref().map(|v| v.view());
        kernel
            .update_gradients_full(&w.view(), &x.view(), x2v.as_ref())
            .unwrap();
        let h = kernel.hyperparameters();
        let mut analytic = vec![h.variance().gradient()[0]];
        match h.inv_lengthscale() {
            Some(inv_l) => analytic.extend(inv_l.gradient().iter()),
            None => analytic.extend(h.lengthscale().gradient().iter()),
        }

        let f = |p: &Vec<f64>| -> f64 {
            let mut k = kernel.clone();
            k.set_param_array(&Array1::from_vec(p.clone())).unwrap();
            objective(&k, &x, x2.as_ref(), &w)
        };
        let p0 = kernel.param_array().to_vec();
        let fd = p0.central_diff(&f);
        assert_eq!(fd.len(), analytic.len());
        for (a, b) in analytic.iter().zip(fd.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }

        // same check in Logexp optimizer space
        let g = |p: &Vec<f64>| -> f64 {
            let mut k = kernel.clone();
            k.set_optimizer_array(&Array1::from_vec(p.clone())).unwrap();
            objective(&k, &x, x2.as_ref(), &w)
        };
        let o0 = kernel.optimizer_array().to_vec();
        let fd = o0.central_diff(&g);
        let analytic = kernel.optimizer_gradient();
        for (a, b) in analytic.iter().zip(fd.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    macro_rules! test_gradients {
        ($name:ident, $ard:expr, $inv_l:expr, $cross:expr) => {
            paste! {
                #[test]
                fn [<test_gradients_ $name>]() {
                    let x = random_matrix((5, 2), 7);
                    let x2 = if $cross { Some(random_matrix((3, 2), 8)) } else { None };
                    let lengthscale = if $ard { array![0.7, 1.3] } else { array![0.9] };
                    let kernel = RbfKernel::<f64>::params(2)
                        .variance(1.7)
                        .lengthscale(lengthscale)
                        .ard($ard)
                        .inv_l($inv_l)
                        .build()
                        .unwrap();
                    check_param_gradients(kernel, x, x2);
                }
            }
        };
    }

    test_gradients!(scalar, false, false, false);
    test_gradients!(scalar_cross, false, false, true);
    test_gradients!(ard, true, false, false);
    test_gradients!(ard_cross, true, false, true);
    test_gradients!(inv_l, false, true, false);
    test_gradients!(ard_inv_l_cross, true, true, true);

    #[test]
    fn test_gradients_kernel_kernel() {
        let metric = DistanceMetric::<f64>::Cityblock;
        let kernel = RbfKernel::kernel_kernel_params(metric)
            .input_dim(3)
            .lengthscale(array![2.])
            .inv_l(true)
            .build()
            .unwrap();
        check_param_gradients(kernel, random_matrix((4, 3), 9), None);
    }

    #[test]
    fn test_gradients_distance_builder() {
        let builder = Arc::new(PrecomputedDistances::new(table4()));
        let kernel = RbfKernel::distance_builder_params(builder, 4)
            .variance(0.8)
            .lengthscale(array![3.])
            .build()
            .unwrap();
        let x = array![[0.], [1.], [2.], [3.]];
        let x2 = array![[3.], [0.]];
        check_param_gradients(kernel, x, Some(x2));
    }

    #[test]
    fn test_gradients_x() {
        for ard in [false, true] {
            let kernel = RbfKernel::<f64>::params(2)
                .ard(ard)
                .lengthscale(if ard { array![0.8, 1.4] } else { array![0.8] })
                .build()
                .unwrap();
            let x = random_matrix((4, 2), 10);
            let x2 = random_matrix((3, 2), 11);
            for cross in [false, true] {
                let x2o = if cross { Some(&x2) } else { None };
                let n2 = if cross { 3 } else { 4 };
                let w = random_matrix((4, n2), 12);
                let x2v = x2o.map(|v| v.view());
                let grad = kernel
                    .gradients_x(&w.view(), &x.view(), x2v.as_ref())
                    .unwrap();
                let f = |p: &Vec<f64>| -> f64 {
                    let xp = Array::from_shape_vec((4, 2), p.clone()).unwrap();
                    let fresh = kernel.clone();
                    objective(&fresh, &xp, x2o, &w)
                };
                let fd = x.iter().cloned().collect::<Vec<f64>>().central_diff(&f);
                let fd = Array::from_shape_vec((4, 2), fd).unwrap();
                assert_abs_diff_eq!(grad, fd, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_gradients_x_undefined_for_kernel_kernels() {
        let builder = Arc::new(PrecomputedDistances::new(table4()));
        let kernel = RbfKernel::distance_builder_params(builder, 4)
            .build()
            .unwrap();
        let x = array![[0.], [1.]];
        let w = Array2::ones((2, 2));
        assert!(kernel.gradients_x(&w.view(), &x.view(), None).is_err());
    }

    #[test]
    fn test_spectrum() {
        let kernel = RbfKernel::<f64>::params(1)
            .variance(2.)
            .lengthscale(array![0.5])
            .build()
            .unwrap();
        let s = kernel.spectrum(&array![0., 1.]).unwrap();
        let c = 2. * f64::sqrt(2. * std::f64::consts::PI) * 0.5;
        assert_abs_diff_eq!(s, array![c, c * f64::exp(-0.5)], epsilon = 1e-12);
        let kernel = RbfKernel::<f64>::params(2).build().unwrap();
        assert!(kernel.spectrum(&array![0.]).is_err());
    }

    /// Psi computer returning constant statistics and counting calls
    struct MockPsi {
        tag: f64,
        calls: AtomicUsize,
    }

    impl MockPsi {
        fn new(tag: f64) -> Self {
            MockPsi {
                tag,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PsiComputer<f64> for MockPsi {
        fn psi_computations(
            &self,
            kernel: &RbfKernel<f64>,
            z: &Array2<f64>,
            posterior: &VariationalPosterior<f64>,
            return_psi2_n: bool,
        ) -> Result<PsiStatistics<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (n, m) = (posterior.mean.nrows(), z.nrows());
            let psi2 = if return_psi2_n {
                Psi2::PerPoint(Array3::from_elem((n, m, m), self.tag))
            } else {
                Psi2::Summed(Array2::from_elem((m, m), self.tag * n as f64))
            };
            Ok(PsiStatistics {
                psi0: Array1::from_elem(n, kernel.variance()),
                psi1: Array2::from_elem((n, m), self.tag),
                psi2,
            })
        }

        fn psi_derivative_computations(
            &self,
            kernel: &RbfKernel<f64>,
            dl_dpsi0: &Array1<f64>,
            _dl_dpsi1: &Array2<f64>,
            _dl_dpsi2: &Psi2<f64>,
            z: &Array2<f64>,
            posterior: &VariationalPosterior<f64>,
        ) -> Result<PsiDerivatives<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PsiDerivatives {
                dvariance: dl_dpsi0.sum(),
                dlengthscale: Array1::from_elem(kernel.lengthscale().len(), self.tag),
                dz: Array2::from_elem(z.dim(), self.tag),
                dmu: Array2::from_elem(posterior.mean.dim(), 1.),
                ds: Array2::from_elem(posterior.variance.dim(), 2.),
            })
        }
    }

    #[test]
    fn test_psi_statistics_pass_through() {
        let cpu = Arc::new(MockPsi::new(1.));
        let gpu = Arc::new(MockPsi::new(2.));
        let mut kernel = RbfKernel::<f64>::params(1)
            .variance(3.)
            .lengthscale(array![2.])
            .inv_l(true)
            .psi_computer(cpu.clone())
            .gpu_psi_computer(gpu.clone())
            .use_gpu(true)
            .build()
            .unwrap();
        let z = array![[0.], [1.]];
        let q = VariationalPosterior::new(array![[0.], [0.5], [1.]], Array2::ones((3, 1)));

        assert_eq!(kernel.psi0(&z, &q).unwrap(), array![3., 3., 3.]);
        assert_eq!(kernel.psi1(&z, &q).unwrap(), Array2::from_elem((3, 2), 2.));
        assert_eq!(kernel.psi2(&z, &q).unwrap(), Array2::from_elem((2, 2), 6.));
        assert_eq!(kernel.psi2n(&z, &q).unwrap().dim(), (3, 2, 2));
        assert_eq!(gpu.calls.load(Ordering::SeqCst), 4);
        assert_eq!(cpu.calls.load(Ordering::SeqCst), 0);

        let dl_dpsi0 = array![1., 1., 1.];
        let dl_dpsi1 = Array2::zeros((3, 2));
        let dl_dpsi2 = Psi2::Summed(Array2::zeros((2, 2)));
        kernel
            .update_gradients_expectations(&dl_dpsi0, &dl_dpsi1, &dl_dpsi2, &z, &q)
            .unwrap();
        let h = kernel.hyperparameters();
        assert_eq!(h.variance().gradient()[0], 3.);
        assert_eq!(h.lengthscale().gradient()[0], 2.);
        assert_abs_diff_eq!(
            h.inv_lengthscale().unwrap().gradient()[0],
            2. * 8. / -2.,
            epsilon = 1e-9
        );
        let dz = kernel
            .gradients_z_expectations(&dl_dpsi0, &dl_dpsi1, &dl_dpsi2, &z, &q)
            .unwrap();
        assert_eq!(dz, Array2::from_elem((2, 1), 2.));
        let (dmu, ds) = kernel
            .gradients_qx_expectations(&dl_dpsi0, &dl_dpsi1, &dl_dpsi2, &z, &q)
            .unwrap();
        assert_eq!(dmu, Array2::<f64>::ones((3, 1)));
        assert_eq!(ds, Array2::from_elem((3, 1), 2.));
    }

    #[test]
    fn test_psi_cpu_selected_by_default() {
        let cpu = Arc::new(MockPsi::new(1.));
        let kernel = RbfKernel::<f64>::params(1)
            .psi_computer(cpu.clone())
            .build()
            .unwrap();
        let z = array![[0.]];
        let q = VariationalPosterior::new(array![[0.]], array![[1.]]);
        kernel.psi1(&z, &q).unwrap();
        assert_eq!(cpu.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_psi_without_computer() {
        let kernel = RbfKernel::<f64>::params(1).build().unwrap();
        let z = array![[0.]];
        let q = VariationalPosterior::new(array![[0.]], array![[1.]]);
        assert!(matches!(
            kernel.psi0(&z, &q),
            Err(KernelError::MissingPsiComputer(_))
        ));
    }

    #[test]
    fn test_kernel_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RbfKernel<f64>>();
    }
}
