use crate::cache::DISTANCE_CACHE_LIMIT;
use crate::distances::{DistanceBuilder, DistanceComputer, DistanceMetric};
use crate::errors::{KernelError, Result};
use crate::kernel::RbfKernel;
use crate::psi::PsiComputer;
use linfa::{Float, ParamGuard};

use ndarray::Array1;
use std::fmt;
use std::sync::Arc;

/// A set of validated RBF kernel parameters.
#[derive(Clone)]
pub struct RbfValidParams<F: Float> {
    /// Number of input components seen by the kernel
    pub(crate) input_dim: usize,
    /// Initial variance
    pub(crate) variance: F,
    /// Initial lengthscale, defaults to ones
    pub(crate) lengthscale: Option<Array1<F>>,
    /// Automatic relevance determination (one lengthscale per component)
    pub(crate) ard: bool,
    /// Columns of the inputs the kernel works on
    pub(crate) active_dims: Option<Vec<usize>>,
    /// Kernel name, defaults to a variant specific name
    pub(crate) name: Option<String>,
    /// Psi statistics computed by the GPU computer
    pub(crate) use_gpu: bool,
    /// Optimize `1 / lengthscale^2` instead of lengthscale
    pub(crate) inv_l: bool,
    /// Distance backend
    pub(crate) distance: DistanceComputer<F>,
    /// CPU psi statistics computer
    pub(crate) psi_computer: Option<Arc<dyn PsiComputer<F>>>,
    /// GPU psi statistics computer
    pub(crate) gpu_psi_computer: Option<Arc<dyn PsiComputer<F>>>,
    /// Number of memoized scaled distance matrices
    pub(crate) cache_limit: usize,
}

impl<F: Float> fmt::Debug for RbfValidParams<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RbfValidParams")
            .field("input_dim", &self.input_dim)
            .field("variance", &self.variance)
            .field("lengthscale", &self.lengthscale)
            .field("ard", &self.ard)
            .field("active_dims", &self.active_dims)
            .field("name", &self.name)
            .field("use_gpu", &self.use_gpu)
            .field("inv_l", &self.inv_l)
            .field("distance", &self.distance)
            .field("cache_limit", &self.cache_limit)
            .finish()
    }
}

impl<F: Float> RbfValidParams<F> {
    fn with_distance(distance: DistanceComputer<F>, input_dim: usize) -> Self {
        RbfValidParams {
            input_dim,
            variance: F::one(),
            lengthscale: None,
            ard: false,
            active_dims: None,
            name: None,
            use_gpu: false,
            inv_l: false,
            distance,
            psi_computer: None,
            gpu_psi_computer: None,
            cache_limit: DISTANCE_CACHE_LIMIT,
        }
    }

    /// Get input dimension
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Get initial variance
    pub fn variance(&self) -> F {
        self.variance
    }

    /// Get initial lengthscale, one value per component with ARD on the euclidean backend
    pub fn lengthscale(&self) -> Array1<F> {
        let n = self.lengthscale_len();
        match &self.lengthscale {
            Some(l) if l.len() == 1 => Array1::from_elem(n, l[0]),
            Some(l) => l.to_owned(),
            None => Array1::ones(n),
        }
    }

    /// Whether automatic relevance determination is requested
    pub fn ard(&self) -> bool {
        self.ard
    }

    /// Get active dimensions
    pub fn active_dims(&self) -> Option<&Vec<usize>> {
        self.active_dims.as_ref()
    }

    /// Get kernel name
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            match self.distance {
                DistanceComputer::Euclidean => "rbf",
                DistanceComputer::Metric(_) => "kernel_kernel",
                DistanceComputer::Lookup { .. } => "rbf_db_kernel_kernel",
            }
            .to_string()
        })
    }

    /// Whether GPU psi statistics are requested
    pub fn use_gpu(&self) -> bool {
        self.use_gpu
    }

    /// Whether inverse lengthscale parameterization is requested
    pub fn inv_l(&self) -> bool {
        self.inv_l
    }

    /// Get distance backend
    pub fn distance(&self) -> &DistanceComputer<F> {
        &self.distance
    }

    /// Get scaled distance cache size
    pub fn cache_limit(&self) -> usize {
        self.cache_limit
    }

    fn lengthscale_len(&self) -> usize {
        match self.distance {
            DistanceComputer::Euclidean if self.ard => self.input_dim,
            _ => 1,
        }
    }
}

#[derive(Clone, Debug)]
/// The set of parameters that can be specified to build an [`RbfKernel`].
pub struct RbfParams<F: Float>(RbfValidParams<F>);

impl<F: Float> RbfParams<F> {
    /// Plain RBF kernel parameters on `input_dim` feature components
    pub fn new(input_dim: usize) -> Self {
        Self(RbfValidParams::with_distance(
            DistanceComputer::Euclidean,
            input_dim,
        ))
    }

    /// Kernel-kernel parameters, inputs are compared with the given `metric`
    pub fn kernel_kernel(metric: DistanceMetric<F>) -> Self {
        Self(RbfValidParams::with_distance(
            DistanceComputer::Metric(metric),
            1,
        ))
    }

    /// Kernel-kernel parameters, inputs are model indices into the distance
    /// table of `n_models` models provided by `builder`
    pub fn distance_builder(builder: Arc<dyn DistanceBuilder<F>>, n_models: usize) -> Self {
        Self(RbfValidParams::with_distance(
            DistanceComputer::Lookup { builder, n_models },
            1,
        ))
    }

    /// A constructor for kernel parameters from validated parameters
    pub fn new_from_valid(params: &RbfValidParams<F>) -> Self {
        Self(params.clone())
    }

    /// Set input dimension
    pub fn input_dim(mut self, input_dim: usize) -> Self {
        self.0.input_dim = input_dim;
        self
    }

    /// Set initial variance
    pub fn variance(mut self, variance: F) -> Self {
        self.0.variance = variance;
        self
    }

    /// Set initial lengthscale.
    ///
    /// A single value is broadcasted to every component when ARD is active.
    pub fn lengthscale(mut self, lengthscale: Array1<F>) -> Self {
        self.0.lengthscale = Some(lengthscale);
        self
    }

    /// Set automatic relevance determination
    pub fn ard(mut self, ard: bool) -> Self {
        self.0.ard = ard;
        self
    }

    /// Set the input columns the kernel works on
    pub fn active_dims(mut self, active_dims: Vec<usize>) -> Self {
        self.0.active_dims = Some(active_dims);
        self
    }

    /// Set kernel name
    pub fn name(mut self, name: &str) -> Self {
        self.0.name = Some(name.to_string());
        self
    }

    /// Use GPU psi statistics computer
    pub fn use_gpu(mut self, use_gpu: bool) -> Self {
        self.0.use_gpu = use_gpu;
        self
    }

    /// Optimize `1 / lengthscale^2` instead of lengthscale
    pub fn inv_l(mut self, inv_l: bool) -> Self {
        self.0.inv_l = inv_l;
        self
    }

    /// Set CPU psi statistics computer
    pub fn psi_computer(mut self, computer: Arc<dyn PsiComputer<F>>) -> Self {
        self.0.psi_computer = Some(computer);
        self
    }

    /// Set GPU psi statistics computer
    pub fn gpu_psi_computer(mut self, computer: Arc<dyn PsiComputer<F>>) -> Self {
        self.0.gpu_psi_computer = Some(computer);
        self
    }

    /// Set the number of memoized scaled distance matrices
    pub fn cache_limit(mut self, cache_limit: usize) -> Self {
        self.0.cache_limit = cache_limit;
        self
    }

    /// Validate parameters and build the kernel
    pub fn build(self) -> Result<RbfKernel<F>> {
        Ok(RbfKernel::new(self.check()?))
    }
}

impl<F: Float> From<RbfValidParams<F>> for RbfParams<F> {
    fn from(valid: RbfValidParams<F>) -> Self {
        RbfParams(valid)
    }
}

impl<F: Float> ParamGuard for RbfParams<F> {
    type Checked = RbfValidParams<F>;
    type Error = KernelError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        let p = &self.0;
        if p.input_dim == 0 {
            return Err(KernelError::InvalidValueError(
                "`input_dim` cannot be 0!".to_string(),
            ));
        }
        if !(p.variance > F::zero()) || !p.variance.is_finite() {
            return Err(KernelError::InvalidValueError(format!(
                "variance should be strictly positive, got {}",
                p.variance
            )));
        }
        if let Some(l) = &p.lengthscale {
            if l.iter().any(|v| !(*v > F::zero()) || !v.is_finite()) {
                return Err(KernelError::InvalidValueError(format!(
                    "lengthscale should be strictly positive, got {l}"
                )));
            }
            let expected = p.lengthscale_len();
            if l.len() != 1 && l.len() != expected {
                return Err(KernelError::ShapeMismatch(format!(
                    "lengthscale of length {} given, expected 1 or {}",
                    l.len(),
                    expected
                )));
            }
        }
        match p.distance {
            DistanceComputer::Lookup { .. } if p.input_dim != 1 => {
                return Err(KernelError::InvalidValueError(format!(
                    "distance builder kernel-kernel requires `input_dim` = 1, got {}",
                    p.input_dim
                )));
            }
            DistanceComputer::Metric(_) | DistanceComputer::Lookup { .. }
                if p.ard && p.input_dim > 1 =>
            {
                return Err(KernelError::InvalidValueError(
                    "ARD on kernel-kernels is only supported with `input_dim` = 1".to_string(),
                ));
            }
            _ => (),
        }
        if let Some(dims) = &p.active_dims {
            if dims.len() != p.input_dim {
                return Err(KernelError::ShapeMismatch(format!(
                    "{} active dimensions given for `input_dim` = {}",
                    dims.len(),
                    p.input_dim
                )));
            }
        }
        if p.use_gpu && p.gpu_psi_computer.is_none() {
            return Err(KernelError::InvalidValueError(
                "`use_gpu` requires a GPU psi statistics computer".to_string(),
            ));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
