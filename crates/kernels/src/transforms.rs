//! Positivity transforms applied to hyperparameters in optimizer space.

use linfa::Float;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// Above this value `ln(1 + e^x)` is `x` at machine precision
const LOGEXP_LIM_VAL: f64 = 36.;

/// Softplus bijection between the real line (optimizer space) and
/// strictly positive values (model space): `f(x) = ln(1 + e^x)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct Logexp();

impl From<Logexp> for String {
    fn from(_item: Logexp) -> String {
        "logexp".to_string()
    }
}

impl TryFrom<String> for Logexp {
    type Error = &'static str;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "logexp" {
            Ok(Self::default())
        } else {
            Err("Bad string value for Logexp, should be \'logexp\'")
        }
    }
}

impl Logexp {
    /// Optimizer space to model space
    pub fn f<F: Float>(&self, x: F) -> F {
        let lim = F::cast(LOGEXP_LIM_VAL);
        if x > lim {
            x
        } else {
            // lower clip where e^x underflows
            let low = -F::max_value().ln();
            x.max(low).exp().ln_1p()
        }
    }

    /// Model space to optimizer space
    pub fn finv<F: Float>(&self, f: F) -> F {
        if f > F::cast(LOGEXP_LIM_VAL) {
            f
        } else {
            f.exp_m1().ln()
        }
    }

    /// Chain `df`, a gradient in model space, into optimizer space
    /// given the model space value `f`
    pub fn gradfactor<F: Float>(&self, f: F, df: F) -> F {
        if f > F::cast(LOGEXP_LIM_VAL) {
            df
        } else {
            -df * (-f).exp_m1()
        }
    }
}

impl fmt::Display for Logexp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "+ve")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_logexp_bijection() {
        let t = Logexp::default();
        for v in [1e-6f64, 0.3, 1., 7.5, 50.] {
            assert_abs_diff_eq!(t.f(t.finv(v)), v, epsilon = 1e-9 * v.max(1.));
            assert!(t.f(t.finv(v)) > 0.);
        }
        assert!(t.f(-100.) > 0.);
    }

    #[test]
    fn test_logexp_gradfactor() {
        let t = Logexp::default();
        let e = 1e-6;
        for x in [-2., 0., 0.7, 3.] {
            let fd = (t.f(x + e) - t.f(x - e)) / (2. * e);
            assert_abs_diff_eq!(t.gradfactor(t.f(x), 1.), fd, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_logexp_large_negative_values() {
        let t = Logexp::default();
        assert_abs_diff_eq!(t.f(-100f64) / f64::exp(-100.), 1., epsilon = 1e-12);
        assert!(t.f(-60f64) < t.f(-40f64));

        let e = 1e-3;
        for x in [-40f64, -50., -300.] {
            let fd = (t.f(x + e) - t.f(x - e)) / (2. * e);
            assert_abs_diff_eq!(t.gradfactor(t.f(x), 1.) / fd, 1., epsilon = 1e-6);
        }
        assert!(t.f(-1e4f64) > 0.);
        assert!(t.f(-1e4f32) > 0.);
    }
}
