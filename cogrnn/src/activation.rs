use ndarray::{Array2, ArrayView2, Axis, Zip};
use std::{fmt, str::FromStr};

use crate::error::TrainError;

pub fn sigmoid(x: f64) -> f64 {
    let clipped_x = f64::max(f64::min(500., x), -500.);
    1. / (1. + f64::exp(-clipped_x))
}

pub fn dsigmoid(x: f64) -> f64 {
    sigmoid(x) * (1. - sigmoid(x))
}

fn softplus(x: f64) -> f64 {
    if x > 30. {
        x
    } else {
        f64::ln_1p(f64::exp(x))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenActivation {
    Linear,
    Rectify,
    Tanh,
    Sigmoid,
    Softplus,
}

impl HiddenActivation {
    pub fn f(self, x: f64) -> f64 {
        match self {
            HiddenActivation::Linear => x,
            HiddenActivation::Rectify => x.max(0.),
            HiddenActivation::Tanh => x.tanh(),
            HiddenActivation::Sigmoid => sigmoid(x),
            HiddenActivation::Softplus => softplus(x),
        }
    }

    pub fn df(self, x: f64) -> f64 {
        match self {
            HiddenActivation::Linear => 1.,
            HiddenActivation::Rectify => (x > 0.) as u8 as f64,
            HiddenActivation::Tanh => 1. - x.tanh().powi(2),
            HiddenActivation::Sigmoid => dsigmoid(x),
            HiddenActivation::Softplus => sigmoid(x),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HiddenActivation::Linear => "linear",
            HiddenActivation::Rectify => "rectify",
            HiddenActivation::Tanh => "tanh",
            HiddenActivation::Sigmoid => "sigmoid",
            HiddenActivation::Softplus => "softplus",
        }
    }
}

impl FromStr for HiddenActivation {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(HiddenActivation::Linear),
            "rectify" => Ok(HiddenActivation::Rectify),
            "tanh" => Ok(HiddenActivation::Tanh),
            "sigmoid" => Ok(HiddenActivation::Sigmoid),
            "softplus" => Ok(HiddenActivation::Softplus),
            other => Err(TrainError::UnknownHiddenActivation(other.into())),
        }
    }
}

impl fmt::Display for HiddenActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Output nonlinearity. Each one is paired with the loss it is trained
/// against: squared error for `Linear` and `Rectify`, binary cross-entropy for
/// `Sigmoid`, categorical cross-entropy for `Softmax`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputActivation {
    Linear,
    Rectify,
    Sigmoid,
    Softmax,
}

const LOG_FLOOR: f64 = 1e-12;

impl OutputActivation {
    /// Applies the nonlinearity to pre-activations of shape (trials, outputs).
    pub fn apply(self, pre: ArrayView2<f64>) -> Array2<f64> {
        match self {
            OutputActivation::Linear => pre.to_owned(),
            OutputActivation::Rectify => pre.mapv(|v| v.max(0.)),
            OutputActivation::Sigmoid => pre.mapv(sigmoid),
            OutputActivation::Softmax => {
                let mut z = pre.to_owned();
                for mut row in z.axis_iter_mut(Axis(0)) {
                    let max = row.fold(f64::NEG_INFINITY, |a, v| a.max(*v));
                    row.mapv_inplace(|v| (v - max).exp());
                    let sum = row.sum();
                    row /= sum;
                }
                z
            }
        }
    }

    /// Elementwise loss between outputs `z` and targets `y`.
    pub fn loss(self, z: f64, y: f64) -> f64 {
        match self {
            OutputActivation::Linear | OutputActivation::Rectify => (z - y).powi(2),
            OutputActivation::Sigmoid => {
                let z = z.clamp(LOG_FLOOR, 1. - LOG_FLOOR);
                -(y * z.ln() + (1. - y) * (1. - z).ln())
            }
            OutputActivation::Softmax => -y * z.max(LOG_FLOOR).ln(),
        }
    }

    /// Gradient of `sum(weight * loss(z, y))` with respect to the
    /// pre-activations, for one time step of shape (trials, outputs).
    pub fn loss_grad(
        self,
        pre: ArrayView2<f64>,
        z: ArrayView2<f64>,
        y: ArrayView2<f64>,
        weight: ArrayView2<f64>,
    ) -> Array2<f64> {
        match self {
            OutputActivation::Linear => Zip::from(&z)
                .and(&y)
                .and(&weight)
                .map_collect(|z, y, w| 2. * w * (z - y)),
            OutputActivation::Rectify => Zip::from(&pre)
                .and(&z)
                .and(&y)
                .and(&weight)
                .map_collect(|p, z, y, w| if *p > 0. { 2. * w * (z - y) } else { 0. }),
            OutputActivation::Sigmoid => Zip::from(&z)
                .and(&y)
                .and(&weight)
                .map_collect(|z, y, w| w * (z - y)),
            OutputActivation::Softmax => {
                let wy = &weight * &y;
                let total = wy.sum_axis(Axis(1)).insert_axis(Axis(1));
                &z * &total - &wy
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OutputActivation::Linear => "linear",
            OutputActivation::Rectify => "rectify",
            OutputActivation::Sigmoid => "sigmoid",
            OutputActivation::Softmax => "softmax",
        }
    }

    pub fn loss_name(self) -> &'static str {
        match self {
            OutputActivation::Linear | OutputActivation::Rectify => "squared",
            OutputActivation::Sigmoid => "binary cross entropy",
            OutputActivation::Softmax => "categorical cross entropy",
        }
    }
}

impl FromStr for OutputActivation {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(OutputActivation::Linear),
            "rectify" => Ok(OutputActivation::Rectify),
            "sigmoid" => Ok(OutputActivation::Sigmoid),
            "softmax" => Ok(OutputActivation::Softmax),
            other => Err(TrainError::UnknownOutputActivation(other.into())),
        }
    }
}

/// Keeps effective weights non-negative before the E/I sign is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EiPositive {
    Abs,
    Rectify,
}

impl EiPositive {
    pub fn f(self, w: f64) -> f64 {
        match self {
            EiPositive::Abs => w.abs(),
            EiPositive::Rectify => w.max(0.),
        }
    }

    pub fn df(self, w: f64) -> f64 {
        match self {
            EiPositive::Abs => w.signum() * (w != 0.) as u8 as f64,
            EiPositive::Rectify => (w > 0.) as u8 as f64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EiPositive::Abs => "absolute value",
            EiPositive::Rectify => "rectify",
        }
    }
}

impl FromStr for EiPositive {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abs" => Ok(EiPositive::Abs),
            "rectify" => Ok(EiPositive::Rectify),
            other => Err(TrainError::UnknownEiPositiveFunc(other.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn hidden_derivatives_match_finite_differences() {
        let h = 1e-6;
        for act in [
            HiddenActivation::Linear,
            HiddenActivation::Tanh,
            HiddenActivation::Sigmoid,
            HiddenActivation::Softplus,
            HiddenActivation::Rectify,
        ] {
            for x in [-1.3, -0.2, 0.4, 2.1] {
                let numeric = (act.f(x + h) - act.f(x - h)) / (2. * h);
                assert!((numeric - act.df(x)).abs() < 1e-5, "{act} at {x}");
            }
        }
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let z = OutputActivation::Softmax.apply(array![[1., 2., 3.], [1000., 0., -1000.]].view());
        for row in z.rows() {
            assert!((row.sum() - 1.).abs() < 1e-12);
        }
        assert!(z[[1, 0]] > 0.999);
    }

    #[test]
    fn softmax_gradient_matches_finite_differences() {
        let pre = array![[0.3, -0.5, 1.2]];
        let y = array![[0., 1., 0.]];
        let w = array![[1., 1., 1.]];
        let act = OutputActivation::Softmax;

        let total = |pre: &Array2<f64>| -> f64 {
            let z = act.apply(pre.view());
            Zip::from(&z).and(&y).fold(0., |a, z, y| a + act.loss(*z, *y))
        };

        let z = act.apply(pre.view());
        let grad = act.loss_grad(pre.view(), z.view(), y.view(), w.view());

        let h = 1e-6;
        for k in 0..3 {
            let mut plus = pre.clone();
            plus[[0, k]] += h;
            let mut minus = pre.clone();
            minus[[0, k]] -= h;
            let numeric = (total(&plus) - total(&minus)) / (2. * h);
            assert!((numeric - grad[[0, k]]).abs() < 1e-6);
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(
            "relu6".parse::<HiddenActivation>(),
            Err(TrainError::UnknownHiddenActivation(_))
        ));
        assert!(matches!(
            "tanh".parse::<OutputActivation>(),
            Err(TrainError::UnknownOutputActivation(_))
        ));
        assert!(matches!(
            "square".parse::<EiPositive>(),
            Err(TrainError::UnknownEiPositiveFunc(_))
        ));
    }
}
