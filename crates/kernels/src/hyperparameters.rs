//! Hyperparameters of RBF kernels and their exposure to an external optimizer.
//!
//! A kernel owns a `variance` and a `lengthscale` [`Param`]. In
//! [`LengthscaleMode::Inverse`] the optimizer sees `inv_lengthscale = 1 / lengthscale^2`
//! instead of the lengthscale which then becomes a derived quantity.

use crate::errors::{KernelError, Result};
use crate::transforms::Logexp;
use linfa::Float;
use log::warn;
use ndarray::{Array1, ArrayBase, Axis, Data, Ix1};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Guard added to `inv_l` before taking its inverse square root
pub const INV_L_EPSILON: f64 = 1e-200;

/// [`INV_L_EPSILON`] raised for float types where it would underflow,
/// `lengthscale^3` has to stay finite when `inv_l` reaches zero
pub(crate) fn inv_l_epsilon<F: Float>() -> F {
    let overflow_guard = F::cast(1e3) * F::max_value().powf(F::cast(-2. / 3.));
    F::cast(INV_L_EPSILON).max(overflow_guard)
}

/// A named hyperparameter with its accumulated gradient
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct Param<F: Float> {
    name: String,
    value: Array1<F>,
    gradient: Array1<F>,
    transform: Logexp,
    /// Zero is a valid value (guarded downstream)
    allow_zero: bool,
}

impl<F: Float> Param<F> {
    /// Positive parameter constructor, gradient is set to zero
    pub fn new(name: &str, value: Array1<F>) -> Self {
        let gradient = Array1::zeros(value.len());
        Param {
            name: name.to_string(),
            value,
            gradient,
            transform: Logexp::default(),
            allow_zero: false,
        }
    }

    fn non_negative(mut self) -> Self {
        self.allow_zero = true;
        self
    }

    /// Parameter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value
    pub fn value(&self) -> &Array1<F> {
        &self.value
    }

    /// Gradient accumulated during the current evaluation cycle
    pub fn gradient(&self) -> &Array1<F> {
        &self.gradient
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Whether parameter has no component
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Positivity transform of the parameter
    pub fn transform(&self) -> &Logexp {
        &self.transform
    }

    fn check_value(&self, value: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()> {
        check_len(&self.name, self.value.len(), value.len())?;
        let valid = |v: F| v > F::zero() || (self.allow_zero && v == F::zero());
        if let Some(v) = value.iter().find(|v| !valid(**v)) {
            return Err(KernelError::InvalidValueError(format!(
                "{} should be positive, got {}",
                self.name, v
            )));
        }
        Ok(())
    }

    fn set_value(&mut self, value: Array1<F>) -> Result<()> {
        self.check_value(&value)?;
        self.value = value;
        Ok(())
    }

    fn add_gradient(&mut self, grad: &ArrayBase<impl Data<Elem = F>, Ix1>) {
        self.gradient += grad;
    }

    fn set_gradient(&mut self, grad: Array1<F>) {
        self.gradient = grad;
    }

    fn reset_gradient(&mut self) {
        self.gradient.fill(F::zero());
    }

    /// Value mapped to the unconstrained optimizer space
    fn optimizer_value(&self) -> Array1<F> {
        self.value.mapv(|v| self.transform.finv(v))
    }

    /// Gradient chained into the unconstrained optimizer space
    fn optimizer_gradient(&self) -> Array1<F> {
        let mut g = self.gradient.to_owned();
        g.iter_mut()
            .zip(self.value.iter())
            .for_each(|(g, v)| *g = self.transform.gradfactor(*v, *g));
        g
    }
}

fn check_len(name: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(KernelError::ShapeMismatch(format!(
            "{name} expects {expected} value(s), got {got}"
        )));
    }
    Ok(())
}

/// Lengthscale parameterization, fixed at kernel construction
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub enum LengthscaleMode<F: Float> {
    /// The lengthscale is optimized directly
    Native,
    /// `inv_l = 1 / lengthscale^2` is optimized, lengthscale is derived from it
    Inverse {
        /// Inverse squared lengthscale parameter
        inv_l: Param<F>,
    },
}

/// Variance and lengthscale of an RBF kernel
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub struct Hyperparameters<F: Float> {
    variance: Param<F>,
    lengthscale: Param<F>,
    mode: LengthscaleMode<F>,
    /// Bumped each time the lengthscale value changes
    generation: u64,
}

impl<F: Float> Hyperparameters<F> {
    /// Constructor, values are expected to be validated already
    pub fn new(variance: F, lengthscale: Array1<F>, inv_l: bool) -> Self {
        let mode = if inv_l {
            LengthscaleMode::Inverse {
                inv_l: Param::new("inv_lengthscale", lengthscale.mapv(|l| F::one() / (l * l)))
                    .non_negative(),
            }
        } else {
            LengthscaleMode::Native
        };
        let mut hyper = Hyperparameters {
            variance: Param::new("variance", Array1::from_elem(1, variance)),
            lengthscale: Param::new("lengthscale", lengthscale),
            mode,
            generation: 0,
        };
        hyper.parameters_changed();
        hyper
    }

    /// Variance parameter
    pub fn variance(&self) -> &Param<F> {
        &self.variance
    }

    /// Lengthscale parameter (derived in inverse mode)
    pub fn lengthscale(&self) -> &Param<F> {
        &self.lengthscale
    }

    /// Inverse squared lengthscale parameter when inverse mode is active
    pub fn inv_lengthscale(&self) -> Option<&Param<F>> {
        match &self.mode {
            LengthscaleMode::Native => None,
            LengthscaleMode::Inverse { inv_l } => Some(inv_l),
        }
    }

    /// Lengthscale parameterization
    pub fn mode(&self) -> &LengthscaleMode<F> {
        &self.mode
    }

    /// Whether inverse lengthscale parameterization is active
    pub fn use_inv_lengthscale(&self) -> bool {
        matches!(self.mode, LengthscaleMode::Inverse { .. })
    }

    /// Lengthscale generation, changes whenever lengthscale value changes
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current scalar variance
    pub fn variance_value(&self) -> F {
        self.variance.value[0]
    }

    /// Set variance value
    pub fn set_variance(&mut self, variance: F) -> Result<()> {
        self.variance.set_value(Array1::from_elem(1, variance))
    }

    /// Set lengthscale value, `inv_l` is kept consistent in inverse mode
    pub fn set_lengthscale(&mut self, lengthscale: Array1<F>) -> Result<()> {
        self.lengthscale.set_value(lengthscale)?;
        if let LengthscaleMode::Inverse { inv_l } = &mut self.mode {
            let v = self.lengthscale.value.mapv(|l| F::one() / (l * l));
            inv_l.set_value(v)?;
        }
        self.parameters_changed();
        Ok(())
    }

    /// Set `inv_l` value, fails when inverse mode is not active
    pub fn set_inv_lengthscale(&mut self, value: Array1<F>) -> Result<()> {
        match &mut self.mode {
            LengthscaleMode::Inverse { inv_l } => inv_l.set_value(value)?,
            LengthscaleMode::Native => {
                return Err(KernelError::InvalidValueError(
                    "inv_lengthscale is not a parameter of a kernel built without inv_l".to_string(),
                ))
            }
        }
        self.parameters_changed();
        Ok(())
    }

    /// Recompute derived lengthscale from `inv_l` and mark distances stale
    fn parameters_changed(&mut self) {
        if let LengthscaleMode::Inverse { inv_l } = &self.mode {
            let eps = inv_l_epsilon::<F>();
            if inv_l.value.iter().any(|v| *v <= eps) {
                warn!("inv_lengthscale reached its lower guard value {eps:e}");
            }
            self.lengthscale.value = inv_l.value.mapv(|v| F::one() / (v + eps).sqrt());
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// Names of the parameters exposed to the optimizer
    pub fn parameter_names(&self) -> Vec<&str> {
        match &self.mode {
            LengthscaleMode::Native => vec![self.variance.name(), self.lengthscale.name()],
            LengthscaleMode::Inverse { inv_l } => vec![self.variance.name(), inv_l.name()],
        }
    }

    fn optimized(&self) -> [&Param<F>; 2] {
        match &self.mode {
            LengthscaleMode::Native => [&self.variance, &self.lengthscale],
            LengthscaleMode::Inverse { inv_l } => [&self.variance, inv_l],
        }
    }

    /// Number of scalar values exposed to the optimizer
    pub fn size(&self) -> usize {
        self.optimized().iter().map(|p| p.len()).sum()
    }

    /// Values of the optimized parameters in model space
    pub fn param_array(&self) -> Array1<F> {
        let vals: Vec<F> = self
            .optimized()
            .iter()
            .flat_map(|p| p.value.to_vec())
            .collect();
        Array1::from_vec(vals)
    }

    /// Values of the optimized parameters in unconstrained optimizer space
    pub fn optimizer_array(&self) -> Array1<F> {
        let vals: Vec<F> = self
            .optimized()
            .iter()
            .flat_map(|p| p.optimizer_value().to_vec())
            .collect();
        Array1::from_vec(vals)
    }

    /// Gradients of the optimized parameters in unconstrained optimizer space
    pub fn optimizer_gradient(&self) -> Array1<F> {
        let vals: Vec<F> = self
            .optimized()
            .iter()
            .flat_map(|p| p.optimizer_gradient().to_vec())
            .collect();
        Array1::from_vec(vals)
    }

    /// Set optimized parameters from model space values, nothing is
    /// updated when one of the values is rejected
    pub fn set_param_array(&mut self, values: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()> {
        check_len("parameter array", self.size(), values.len())?;
        let [variance, lengthscale] = self.optimized();
        let (head, rest) = values.view().split_at(Axis(0), 1);
        variance.check_value(&head)?;
        lengthscale.check_value(&rest)?;

        self.set_variance(head[0])?;
        match self.mode {
            LengthscaleMode::Native => self.set_lengthscale(rest.to_owned()),
            LengthscaleMode::Inverse { .. } => self.set_inv_lengthscale(rest.to_owned()),
        }
    }

    /// Set optimized parameters from unconstrained optimizer space values
    pub fn set_optimizer_array(
        &mut self,
        values: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        let t = Logexp::default();
        self.set_param_array(&values.mapv(|v| t.f(v)))
    }

    /// Zero all gradient slots, to be called at the start of an evaluation cycle
    pub fn reset_gradients(&mut self) {
        self.variance.reset_gradient();
        self.lengthscale.reset_gradient();
        if let LengthscaleMode::Inverse { inv_l } = &mut self.mode {
            inv_l.reset_gradient();
        }
    }

    /// Accumulate into variance gradient
    pub(crate) fn add_variance_gradient(&mut self, grad: F) {
        self.variance.add_gradient(&Array1::from_elem(1, grad));
    }

    /// Accumulate into lengthscale gradient
    pub(crate) fn add_lengthscale_gradient(&mut self, grad: &ArrayBase<impl Data<Elem = F>, Ix1>) {
        self.lengthscale.add_gradient(grad);
    }

    /// Overwrite variance and lengthscale gradients
    pub(crate) fn set_gradients(&mut self, dvariance: F, dlengthscale: Array1<F>) {
        self.variance.set_gradient(Array1::from_elem(1, dvariance));
        self.lengthscale.set_gradient(dlengthscale);
    }

    /// Project the lengthscale gradient onto `inv_l` (overwrite) using
    /// `d lengthscale / d inv_l = lengthscale^3 / -2`
    pub(crate) fn project_inv_lengthscale_gradient(&mut self) {
        if let LengthscaleMode::Inverse { inv_l } = &mut self.mode {
            let l = &self.lengthscale.value;
            let g = &self.lengthscale.gradient * &l.mapv(|v| v * v * v / F::cast(-2.));
            inv_l.set_gradient(g);
        }
    }
}
