//! Dictionary representation of kernels.
//!
//! A [`KernelDict`] records what is needed to rebuild a kernel: class
//! identifier, hyperparameter values and distance backend description.
//! Live collaborators (distance builders, psi statistics computers) are not
//! recorded and have to be given back when rebuilding.

use crate::distances::{DistanceBuilder, DistanceComputer, DistanceMetric, MetricKwargs};
use crate::errors::{KernelError, Result};
use crate::kernel::{RbfKernel, RBF_CLASS, RBF_DB_KERNEL_KERNEL_CLASS, RBF_KERNEL_KERNEL_CLASS};
use crate::parameters::RbfParams;
use linfa::Float;
use ndarray::Array1;
use std::sync::Arc;

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "persistent")]
use std::fs;
#[cfg(feature = "persistent")]
use std::io::Write;

/// Serializable description of an [`RbfKernel`]
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct KernelDict<F: Float> {
    /// Kernel variant identifier
    pub class: String,
    /// Number of input components
    pub input_dim: usize,
    /// Variance value
    pub variance: F,
    /// Lengthscale value (`1 / sqrt(inv_l + epsilon)` when `inv_l` is set)
    pub lengthscale: Array1<F>,
    /// Automatic relevance determination flag
    #[cfg_attr(feature = "serializable", serde(rename = "ARD"))]
    pub ard: bool,
    /// Input columns the kernel works on
    pub active_dims: Option<Vec<usize>>,
    /// Kernel name
    pub name: String,
    /// GPU psi statistics flag
    #[cfg_attr(feature = "serializable", serde(rename = "useGPU"))]
    pub use_gpu: bool,
    /// Inverse lengthscale parameterization flag
    pub inv_l: bool,
    /// Metric name of the metric kernel-kernel
    pub metric: Option<String>,
    /// Metric keyword arguments of the metric kernel-kernel
    pub metric_kwargs: MetricKwargs<F>,
    /// Number of models of the distance builder kernel-kernel
    pub n_models: Option<usize>,
}

impl<F: Float> RbfKernel<F> {
    /// Dictionary representation of the kernel
    pub fn to_dict(&self) -> KernelDict<F> {
        // in inverse mode the derived lengthscale already carries the inv_l guard
        let lengthscale = self.lengthscale().to_owned();
        let (metric, metric_kwargs, n_models) = match self.distance() {
            DistanceComputer::Euclidean => (None, MetricKwargs::new(), None),
            DistanceComputer::Metric(m) => (Some(m.name().to_string()), m.kwargs(), None),
            DistanceComputer::Lookup { n_models, .. } => {
                (None, MetricKwargs::new(), Some(*n_models))
            }
        };
        KernelDict {
            class: self.class_name().to_string(),
            input_dim: self.input_dim(),
            variance: self.variance(),
            lengthscale,
            ard: self.ard(),
            active_dims: self.active_dims().cloned(),
            name: self.name().to_string(),
            use_gpu: self.use_gpu(),
            inv_l: self.use_inv_lengthscale(),
            metric,
            metric_kwargs,
            n_models,
        }
    }

    /// Rebuild a kernel from its dictionary representation.
    ///
    /// `builder` is required for the distance builder kernel-kernel.
    /// Kernels recorded with `use_gpu` need a GPU psi statistics computer:
    /// use [`RbfParams::from_dict`] to attach one before building.
    pub fn from_dict(
        dict: &KernelDict<F>,
        builder: Option<Arc<dyn DistanceBuilder<F>>>,
    ) -> Result<Self> {
        RbfParams::from_dict(dict, builder)?.build()
    }
}

impl<F: Float> RbfParams<F> {
    /// Kernel parameters recorded in a dictionary representation
    pub fn from_dict(
        dict: &KernelDict<F>,
        builder: Option<Arc<dyn DistanceBuilder<F>>>,
    ) -> Result<Self> {
        let params = match dict.class.as_str() {
            RBF_CLASS => RbfParams::new(dict.input_dim),
            RBF_KERNEL_KERNEL_CLASS => {
                let name = dict.metric.as_ref().ok_or_else(|| {
                    KernelError::LoadError("metric kernel-kernel without metric".to_string())
                })?;
                let metric = DistanceMetric::from_name(name, &dict.metric_kwargs)
                    .map_err(|e| KernelError::LoadError(format!("metric '{name}': {e}")))?;
                RbfParams::kernel_kernel(metric)
            }
            RBF_DB_KERNEL_KERNEL_CLASS => {
                let builder = builder.ok_or_else(|| {
                    KernelError::LoadError(
                        "distance builder kernel-kernel requires its distance builder".to_string(),
                    )
                })?;
                let n_models = dict.n_models.ok_or_else(|| {
                    KernelError::LoadError(
                        "distance builder kernel-kernel without `n_models`".to_string(),
                    )
                })?;
                RbfParams::distance_builder(builder, n_models)
            }
            class => {
                return Err(KernelError::LoadError(format!(
                    "unknown kernel class '{class}'"
                )))
            }
        };
        let params = params
            .input_dim(dict.input_dim)
            .variance(dict.variance)
            .lengthscale(dict.lengthscale.to_owned())
            .ard(dict.ard)
            .name(&dict.name)
            .use_gpu(dict.use_gpu)
            .inv_l(dict.inv_l);
        Ok(match &dict.active_dims {
            Some(dims) => params.active_dims(dims.to_owned()),
            None => params,
        })
    }
}

#[cfg(feature = "persistent")]
impl<F: Float + Serialize> KernelDict<F> {
    /// Save the kernel dictionary in the given file (JSON format)
    pub fn save(&self, path: &str) -> Result<()> {
        let mut file = fs::File::create(path)?;
        let bytes = serde_json::to_vec(self).map_err(KernelError::SaveError)?;
        file.write_all(&bytes)?;
        Ok(())
    }
}

#[cfg(feature = "persistent")]
impl<F: Float + serde::de::DeserializeOwned> KernelDict<F> {
    /// Load a kernel dictionary from the given file (JSON format)
    pub fn load(path: &str) -> Result<KernelDict<F>> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| KernelError::LoadError(e.to_string()))
    }
}
