//! A module for unscaled distance computations between kernel inputs.
//!
//! Three backends are available as [`DistanceComputer`] variants:
//! * euclidean distance between feature rows (plain RBF kernel),
//! * any named [`DistanceMetric`] between feature rows (metric kernel-kernel),
//! * lookup into a precomputed model-to-model distance table provided by a
//!   [`DistanceBuilder`] (distance-builder kernel-kernel).

use crate::errors::{KernelError, Result};
use linfa::Float;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A metric specific keyword argument
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub enum MetricArg<F: Float> {
    /// Scalar argument (ex: `p` for minkowski)
    Scalar(F),
    /// Vector argument (ex: `V` for seuclidean)
    Vector(Array1<F>),
}

/// Metric keyword arguments by name
pub type MetricKwargs<F> = BTreeMap<String, MetricArg<F>>;

/// User defined distance between two rows
pub type CustomMetricFn<F> = dyn Fn(&ArrayView1<F>, &ArrayView1<F>) -> F + Send + Sync;

/// Distance metric between two feature rows
#[derive(Clone)]
pub enum DistanceMetric<F: Float> {
    /// `sqrt(sum (u - v)^2)`
    Euclidean,
    /// `sum (u - v)^2`
    SqEuclidean,
    /// `sum |u - v|`
    Cityblock,
    /// `max |u - v|`
    Chebyshev,
    /// `(sum |u - v|^p)^(1/p)`
    Minkowski {
        /// Order of the norm
        p: F,
    },
    /// `sqrt(sum (u - v)^2 / V)`
    SEuclidean {
        /// Componentwise variances
        variances: Array1<F>,
    },
    /// `1 - u.v / (|u| |v|)`
    Cosine,
    /// `sum |u - v| / (|u| + |v|)`
    Canberra,
    /// `sum |u - v| / sum |u + v|`
    BrayCurtis,
    /// cosine distance between centered rows
    Correlation,
    /// proportion of differing components
    Hamming,
    /// named user supplied metric
    Custom {
        /// Name recorded at serialization
        name: String,
        /// Distance function
        func: Arc<CustomMetricFn<F>>,
    },
}

impl<F: Float> fmt::Debug for DistanceMetric<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DistanceMetric::Minkowski { p } => write!(f, "Minkowski(p={p})"),
            DistanceMetric::SEuclidean { variances } => write!(f, "SEuclidean(V={variances})"),
            _ => write!(f, "{}", self.name()),
        }
    }
}

impl<F: Float> fmt::Display for DistanceMetric<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn scalar_kwarg<F: Float>(kwargs: &MetricKwargs<F>, key: &str) -> Result<Option<F>> {
    match kwargs.get(key) {
        None => Ok(None),
        Some(MetricArg::Scalar(v)) => Ok(Some(*v)),
        Some(MetricArg::Vector(_)) => Err(KernelError::InvalidValueError(format!(
            "metric argument '{key}' should be a scalar"
        ))),
    }
}

fn vector_kwarg<F: Float>(kwargs: &MetricKwargs<F>, key: &str) -> Result<Option<Array1<F>>> {
    match kwargs.get(key) {
        None => Ok(None),
        Some(MetricArg::Vector(v)) => Ok(Some(v.to_owned())),
        Some(MetricArg::Scalar(_)) => Err(KernelError::InvalidValueError(format!(
            "metric argument '{key}' should be a vector"
        ))),
    }
}

impl<F: Float> DistanceMetric<F> {
    /// Build a metric from its name and keyword arguments
    /// (names follow the usual `cdist` conventions)
    pub fn from_name(name: &str, kwargs: &MetricKwargs<F>) -> Result<Self> {
        let allowed: &[&str] = match name {
            "minkowski" => &["p"],
            "seuclidean" => &["V"],
            _ => &[],
        };
        if let Some(k) = kwargs.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(KernelError::InvalidValueError(format!(
                "unexpected argument '{k}' for metric '{name}'"
            )));
        }
        let metric = match name {
            "euclidean" => DistanceMetric::Euclidean,
            "sqeuclidean" => DistanceMetric::SqEuclidean,
            "cityblock" => DistanceMetric::Cityblock,
            "chebyshev" => DistanceMetric::Chebyshev,
            "minkowski" => {
                let p = scalar_kwarg(kwargs, "p")?.unwrap_or(F::cast(2.));
                if !(p >= F::one()) {
                    return Err(KernelError::InvalidValueError(format!(
                        "minkowski order p should be >= 1, got {p}"
                    )));
                }
                DistanceMetric::Minkowski { p }
            }
            "seuclidean" => {
                let variances = vector_kwarg(kwargs, "V")?.ok_or_else(|| {
                    KernelError::InvalidValueError(
                        "seuclidean metric requires a variance vector 'V'".to_string(),
                    )
                })?;
                if variances.iter().any(|v| !(*v > F::zero())) {
                    return Err(KernelError::InvalidValueError(
                        "seuclidean variances should be strictly positive".to_string(),
                    ));
                }
                DistanceMetric::SEuclidean { variances }
            }
            "cosine" => DistanceMetric::Cosine,
            "canberra" => DistanceMetric::Canberra,
            "braycurtis" => DistanceMetric::BrayCurtis,
            "correlation" => DistanceMetric::Correlation,
            "hamming" => DistanceMetric::Hamming,
            _ => {
                return Err(KernelError::InvalidValueError(format!(
                    "unknown distance metric '{name}'"
                )))
            }
        };
        Ok(metric)
    }

    /// Metric defined by a user function
    pub fn custom(
        name: &str,
        func: impl Fn(&ArrayView1<F>, &ArrayView1<F>) -> F + Send + Sync + 'static,
    ) -> Self {
        DistanceMetric::Custom {
            name: name.to_string(),
            func: Arc::new(func),
        }
    }

    /// Metric name
    pub fn name(&self) -> &str {
        match self {
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::SqEuclidean => "sqeuclidean",
            DistanceMetric::Cityblock => "cityblock",
            DistanceMetric::Chebyshev => "chebyshev",
            DistanceMetric::Minkowski { .. } => "minkowski",
            DistanceMetric::SEuclidean { .. } => "seuclidean",
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Canberra => "canberra",
            DistanceMetric::BrayCurtis => "braycurtis",
            DistanceMetric::Correlation => "correlation",
            DistanceMetric::Hamming => "hamming",
            DistanceMetric::Custom { name, .. } => name,
        }
    }

    /// Whether the metric can be rebuilt from its name and arguments
    pub fn is_named(&self) -> bool {
        !matches!(self, DistanceMetric::Custom { .. })
    }

    /// Keyword arguments needed to rebuild the metric with [`DistanceMetric::from_name`]
    pub fn kwargs(&self) -> MetricKwargs<F> {
        let mut kwargs = MetricKwargs::new();
        match self {
            DistanceMetric::Minkowski { p } => {
                kwargs.insert("p".to_string(), MetricArg::Scalar(*p));
            }
            DistanceMetric::SEuclidean { variances } => {
                kwargs.insert("V".to_string(), MetricArg::Vector(variances.to_owned()));
            }
            _ => (),
        };
        kwargs
    }

    /// Distance between rows `u` and `v`
    pub fn distance(&self, u: &ArrayView1<F>, v: &ArrayView1<F>) -> F {
        let diff = || u.iter().zip(v.iter()).map(|(a, b)| *a - *b);
        match self {
            DistanceMetric::Euclidean => diff().map(|d| d * d).sum::<F>().sqrt(),
            DistanceMetric::SqEuclidean => diff().map(|d| d * d).sum(),
            DistanceMetric::Cityblock => diff().map(|d| d.abs()).sum(),
            DistanceMetric::Chebyshev => diff().map(|d| d.abs()).fold(F::zero(), |a, b| a.max(b)),
            DistanceMetric::Minkowski { p } => diff()
                .map(|d| d.abs().powf(*p))
                .sum::<F>()
                .powf(F::one() / *p),
            DistanceMetric::SEuclidean { variances } => diff()
                .zip(variances.iter())
                .map(|(d, var)| d * d / *var)
                .sum::<F>()
                .sqrt(),
            DistanceMetric::Cosine => cosine(u.iter().cloned(), v.iter().cloned()),
            DistanceMetric::Canberra => u
                .iter()
                .zip(v.iter())
                .map(|(a, b)| {
                    let den = a.abs() + b.abs();
                    if den == F::zero() {
                        F::zero()
                    } else {
                        (*a - *b).abs() / den
                    }
                })
                .sum(),
            DistanceMetric::BrayCurtis => {
                let num: F = diff().map(|d| d.abs()).sum();
                let den: F = u.iter().zip(v.iter()).map(|(a, b)| (*a + *b).abs()).sum();
                num / den
            }
            DistanceMetric::Correlation => {
                let um = u.mean().unwrap_or_else(F::zero);
                let vm = v.mean().unwrap_or_else(F::zero);
                cosine(u.iter().map(|a| *a - um), v.iter().map(|b| *b - vm))
            }
            DistanceMetric::Hamming => {
                let n = u.len().max(1);
                let ndiff = diff().filter(|d| *d != F::zero()).count();
                F::cast(ndiff) / F::cast(n)
            }
            DistanceMetric::Custom { func, .. } => func(u, v),
        }
    }

    /// Pairwise distances between rows of `x` and rows of `x2`
    pub fn pairwise(&self, x: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array2<F>> {
        if x.ncols() != x2.ncols() {
            return Err(KernelError::ShapeMismatch(format!(
                "cannot compute distances between {} and {} components rows",
                x.ncols(),
                x2.ncols()
            )));
        }
        if let DistanceMetric::SEuclidean { variances } = self {
            if variances.len() != x.ncols() {
                return Err(KernelError::ShapeMismatch(format!(
                    "seuclidean variance vector of length {} for {} components rows",
                    variances.len(),
                    x.ncols()
                )));
            }
        }
        let mut d = Array2::zeros((x.nrows(), x2.nrows()));
        Zip::from(d.rows_mut())
            .and(x.rows())
            .par_for_each(|mut d_i, x_i| {
                Zip::from(&mut d_i)
                    .and(x2.rows())
                    .for_each(|d_ij, x2_j| *d_ij = self.distance(&x_i, &x2_j));
            });
        Ok(d)
    }
}

fn cosine<F: Float>(u: impl Iterator<Item = F>, v: impl Iterator<Item = F>) -> F {
    let (dot, nu, nv) = u.zip(v).fold((F::zero(), F::zero(), F::zero()), |acc, (a, b)| {
        (acc.0 + a * b, acc.1 + a * a, acc.2 + b * b)
    });
    F::one() - dot / (nu.sqrt() * nv.sqrt())
}

/// Collaborator providing a square symmetric table of pairwise distances between models
pub trait DistanceBuilder<F: Float>: Send + Sync {
    /// Distance table between the `n_models` first models
    fn get_kernel(&self, n_models: usize) -> Result<Array2<F>>;

    /// Content generation, has to change whenever the table content changes
    fn generation(&self) -> u64 {
        0
    }
}

/// A [`DistanceBuilder`] serving a distance table computed beforehand.
///
/// The table can be updated in place, which bumps its generation
/// and invalidates cached distances of kernels using it.
#[derive(Debug)]
pub struct PrecomputedDistances<F: Float> {
    table: RwLock<Array2<F>>,
    generation: AtomicU64,
}

impl<F: Float> PrecomputedDistances<F> {
    /// Constructor
    pub fn new(table: Array2<F>) -> Self {
        PrecomputedDistances {
            table: RwLock::new(table),
            generation: AtomicU64::new(0),
        }
    }

    /// Replace the distance table
    pub fn update(&self, table: Array2<F>) {
        let mut guard = self.table.write().unwrap_or_else(|e| e.into_inner());
        *guard = table;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of models in the table
    pub fn n_models(&self) -> usize {
        self.table.read().unwrap_or_else(|e| e.into_inner()).nrows()
    }
}

impl<F: Float> DistanceBuilder<F> for PrecomputedDistances<F> {
    /// Returns the leading `n_models x n_models` block, the whole table when `n_models` is 0
    fn get_kernel(&self, n_models: usize) -> Result<Array2<F>> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        if n_models == 0 {
            return Ok(table.to_owned());
        }
        if n_models > table.nrows() || n_models > table.ncols() {
            return Err(KernelError::DistanceBuilderError(format!(
                "{} models requested, only {} available",
                n_models,
                table.nrows()
            )));
        }
        Ok(table.slice(s![..n_models, ..n_models]).to_owned())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Unscaled distance backend of a kernel
#[derive(Clone)]
pub enum DistanceComputer<F: Float> {
    /// Euclidean distance between feature rows
    Euclidean,
    /// Named metric between feature rows
    Metric(DistanceMetric<F>),
    /// Lookup of model indices into a precomputed distance table
    Lookup {
        /// Table provider
        builder: Arc<dyn DistanceBuilder<F>>,
        /// Number of models requested to the builder
        n_models: usize,
    },
}

impl<F: Float> fmt::Debug for DistanceComputer<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DistanceComputer::Euclidean => write!(f, "Euclidean"),
            DistanceComputer::Metric(m) => write!(f, "Metric({m:?})"),
            DistanceComputer::Lookup { n_models, .. } => write!(f, "Lookup(n_models={n_models})"),
        }
    }
}

impl<F: Float> DistanceComputer<F> {
    /// Generation of the underlying distance table if any
    pub fn builder_generation(&self) -> u64 {
        match self {
            DistanceComputer::Lookup { builder, .. } => builder.generation(),
            _ => 0,
        }
    }

    /// Unscaled distances between rows of `x` and rows of `x2` (`x` when `None`)
    pub fn unscaled_distance<'a>(
        &self,
        x: &ArrayView2<'a, F>,
        x2: Option<&ArrayView2<'a, F>>,
    ) -> Result<Array2<F>> {
        let x2 = x2.unwrap_or(x);
        match self {
            DistanceComputer::Euclidean => DistanceMetric::Euclidean.pairwise(x, x2),
            DistanceComputer::Metric(metric) => metric.pairwise(x, x2),
            DistanceComputer::Lookup { builder, n_models } => {
                let table = builder.get_kernel(*n_models)?;
                lookup(&table.view(), x, x2)
            }
        }
    }

    /// Distances scaled by the lengthscale.
    ///
    /// With `ard`, euclidean inputs are scaled componentwise by the lengthscale vector
    /// before computing distances. Kernel-kernel backends always divide by the first
    /// lengthscale value.
    pub fn scaled_distance<'a>(
        &self,
        x: &ArrayView2<'a, F>,
        x2: Option<&ArrayView2<'a, F>>,
        lengthscale: &Array1<F>,
        ard: bool,
    ) -> Result<Array2<F>> {
        match self {
            DistanceComputer::Euclidean if ard => {
                if lengthscale.len() != x.ncols() {
                    return Err(KernelError::ShapeMismatch(format!(
                        "{} lengthscales for {} input components",
                        lengthscale.len(),
                        x.ncols()
                    )));
                }
                let xs = x / lengthscale;
                let x2s = x2.map(|x2| x2 / lengthscale);
                let x2v = x2s.as_ref().map(|v| v.view());
                let d = self.unscaled_distance(&xs.view(), x2v.as_ref())?;
                Ok(d)
            }
            _ => {
                let l = lengthscale[0];
                Ok(self.unscaled_distance(x, x2)? / l)
            }
        }
    }
}

/// Convert a column of model indices (stored as floats) into table indices
fn model_indices<F: Float>(x: &ArrayView2<F>, size: usize) -> Result<Vec<usize>> {
    x.iter()
        .map(|v| {
            let idx = v.trunc();
            match idx.to_usize() {
                Some(i) if idx >= F::zero() && i < size => Ok(i),
                _ => Err(KernelError::IndexOutOfRange {
                    index: format!("{v}"),
                    size,
                }),
            }
        })
        .collect()
}

/// Submatrix `table[rows(x)][:, cols(x2)]`
pub fn lookup<F: Float>(
    table: &ArrayView2<F>,
    x: &ArrayView2<F>,
    x2: &ArrayView2<F>,
) -> Result<Array2<F>> {
    if table.nrows() != table.ncols() {
        return Err(KernelError::ShapeMismatch(format!(
            "distance table should be square, got ({}, {})",
            table.nrows(),
            table.ncols()
        )));
    }
    let rows = model_indices(x, table.nrows())?;
    let cols = model_indices(x2, table.ncols())?;
    Ok(table.select(Axis(0), &rows).select(Axis(1), &cols))
}
