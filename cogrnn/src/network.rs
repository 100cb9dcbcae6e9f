use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::activation::{HiddenActivation, OutputActivation};
use crate::config::Config;
use crate::constraints::Constraints;
use crate::dataset::Minibatch;
use crate::error::{Result, TrainError};

/// Network parameters. The same layout holds raw trainable weights, the
/// effective weights the dynamics run with, and gradients of either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    /// (N, Nin)
    pub win: Array2<f64>,
    /// (N, N), row is postsynaptic
    pub wrec: Array2<f64>,
    /// (Nout, N)
    pub wout: Array2<f64>,
    pub brec: Array1<f64>,
    pub bout: Array1<f64>,
    pub x0: Array1<f64>,
}

/// Which of the optional parameters are trained. `wrec` and `wout` always are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trainables {
    pub win: bool,
    pub brec: bool,
    pub bout: bool,
    pub x0: bool,
}

impl Weights {
    pub fn zeros(n_in: usize, n: usize, n_out: usize) -> Weights {
        Weights {
            win: Array2::zeros((n, n_in)),
            wrec: Array2::zeros((n, n)),
            wout: Array2::zeros((n_out, n)),
            brec: Array1::zeros(n),
            bout: Array1::zeros(n_out),
            x0: Array1::zeros(n),
        }
    }

    pub fn n(&self) -> usize {
        self.wrec.nrows()
    }

    pub fn n_in(&self) -> usize {
        self.win.ncols()
    }

    pub fn n_out(&self) -> usize {
        self.wout.nrows()
    }

    /// Errors unless every tensor fits `n_in` inputs, `n` units and `n_out`
    /// outputs.
    pub fn check_dims(&self, what: &'static str, n_in: usize, n: usize, n_out: usize) -> Result<()> {
        let shapes = [
            (vec![n, n_in], self.win.shape()),
            (vec![n, n], self.wrec.shape()),
            (vec![n_out, n], self.wout.shape()),
            (vec![n], self.brec.shape()),
            (vec![n_out], self.bout.shape()),
            (vec![n], self.x0.shape()),
        ];

        for (expected, actual) in shapes {
            if expected != actual {
                return Err(TrainError::shape(what, &expected, actual));
            }
        }

        Ok(())
    }

    pub fn norm_sq(&self, trainables: &Trainables) -> f64 {
        let sq = |a: f64, v: &f64| a + v * v;

        let mut total = self.wrec.fold(0., sq) + self.wout.fold(0., sq);
        if trainables.win {
            total += self.win.fold(0., sq);
        }
        if trainables.brec {
            total += self.brec.fold(0., sq);
        }
        if trainables.bout {
            total += self.bout.fold(0., sq);
        }
        if trainables.x0 {
            total += self.x0.fold(0., sq);
        }
        total
    }

    /// `self += k * other` over trained parameters.
    pub fn scaled_add(&mut self, k: f64, other: &Weights, trainables: &Trainables) {
        self.wrec.scaled_add(k, &other.wrec);
        self.wout.scaled_add(k, &other.wout);
        if trainables.win {
            self.win.scaled_add(k, &other.win);
        }
        if trainables.brec {
            self.brec.scaled_add(k, &other.brec);
        }
        if trainables.bout {
            self.bout.scaled_add(k, &other.bout);
        }
        if trainables.x0 {
            self.x0.scaled_add(k, &other.x0);
        }
    }

    pub fn scale(&mut self, k: f64) {
        self.win *= k;
        self.wrec *= k;
        self.wout *= k;
        self.brec *= k;
        self.bout *= k;
        self.x0 *= k;
    }

    pub fn is_finite(&self) -> bool {
        let finite = |v: &f64| v.is_finite();

        self.win.iter().all(finite)
            && self.wrec.iter().all(finite)
            && self.wout.iter().all(finite)
            && self.brec.iter().all(finite)
            && self.bout.iter().all(finite)
            && self.x0.iter().all(finite)
    }
}

/// States and outputs of a simulated minibatch, shaped (time, trials, units).
/// `x` and `r` include the initial state at index 0; `pre` and `z` hold the
/// readout for steps 1..=T at index t-1.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub x: Array3<f64>,
    pub r: Array3<f64>,
    pub pre: Array3<f64>,
    pub z: Array3<f64>,
}

impl Trajectory {
    pub fn steps(&self) -> usize {
        self.z.dim().0
    }

    pub fn final_state(&self) -> Array2<f64> {
        self.x.index_axis(Axis(0), self.x.dim().0 - 1).to_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dynamics {
    pub alpha: f64,
    pub hidden: HiddenActivation,
    pub output: OutputActivation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Costs {
    pub loss: f64,
    pub error: f64,
}

impl Dynamics {
    /// Leaky integration of the recurrent state over the time axis.
    ///
    /// Without `x_init`, every trial starts from `eff.x0`.
    pub fn forward(
        &self,
        eff: &Weights,
        inputs: ArrayView3<f64>,
        noise: ArrayView3<f64>,
        x_init: Option<ArrayView2<f64>>,
    ) -> Trajectory {
        let (steps, size, _) = inputs.dim();
        let n = eff.n();
        let n_out = eff.n_out();
        let alpha = self.alpha;
        let hidden = self.hidden;

        let mut x = Array3::zeros((steps + 1, size, n));
        let mut r = Array3::zeros((steps + 1, size, n));
        let mut pre = Array3::zeros((steps, size, n_out));
        let mut z = Array3::zeros((steps, size, n_out));

        match x_init {
            Some(init) => x.index_axis_mut(Axis(0), 0).assign(&init),
            None => x.index_axis_mut(Axis(0), 0).assign(&eff.x0),
        }
        let r0 = x.index_axis(Axis(0), 0).mapv(|v| hidden.f(v));
        r.index_axis_mut(Axis(0), 0).assign(&r0);

        let win_t = eff.win.t();
        let wrec_t = eff.wrec.t();
        let wout_t = eff.wout.t();

        for t in 1..=steps {
            let r_prev = r.index_axis(Axis(0), t - 1);
            let mut drive = r_prev.dot(&wrec_t);
            drive += &inputs.index_axis(Axis(0), t - 1).dot(&win_t);
            drive += &noise.index_axis(Axis(0), t - 1);
            drive += &eff.brec;

            let mut x_t = x.index_axis(Axis(0), t - 1).mapv(|v| (1. - alpha) * v);
            x_t.scaled_add(alpha, &drive);
            let r_t = x_t.mapv(|v| hidden.f(v));

            let mut pre_t = r_t.dot(&wout_t);
            pre_t += &eff.bout;
            let z_t = self.output.apply(pre_t.view());

            x.index_axis_mut(Axis(0), t).assign(&x_t);
            r.index_axis_mut(Axis(0), t).assign(&r_t);
            pre.index_axis_mut(Axis(0), t - 1).assign(&pre_t);
            z.index_axis_mut(Axis(0), t - 1).assign(&z_t);
        }

        Trajectory { x, r, pre, z }
    }

    /// Masked loss normalized by the mask sum, and the masked RMSE.
    pub fn costs(&self, traj: &Trajectory, targets: ArrayView3<f64>, mask: ArrayView3<f64>) -> Costs {
        let output = self.output;
        let masknorm = mask_norm(mask);

        let (loss, sq) = Zip::from(&traj.z).and(&targets).and(&mask).fold(
            (0., 0.),
            |(loss, sq), z, y, m| {
                if *m == 0. {
                    return (loss, sq);
                }
                (loss + m * output.loss(*z, *y), sq + m * (z - y).powi(2))
            },
        );

        Costs {
            loss: loss / masknorm,
            error: (sq / masknorm).sqrt(),
        }
    }
}

fn mask_norm(mask: ArrayView3<f64>) -> f64 {
    mask.sum().max(f64::MIN_POSITIVE)
}

/// Penalty weights added to the task loss.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Regularization {
    pub lambda1_in: f64,
    pub lambda1_rec: f64,
    pub lambda1_out: f64,
    pub lambda2_in: f64,
    pub lambda2_rec: f64,
    pub lambda2_out: f64,
    pub lambda2_r: f64,
    pub lambda_omega: f64,
    /// Squared error-gradient norms below this are left out of `Omega`.
    pub bound: f64,
}

impl Regularization {
    pub fn from_config(config: &Config) -> Regularization {
        Regularization {
            lambda1_in: config.lambda1_in,
            lambda1_rec: config.lambda1_rec,
            lambda1_out: config.lambda1_out,
            lambda2_in: config.lambda2_in,
            lambda2_rec: config.lambda2_rec,
            lambda2_out: config.lambda2_out,
            lambda2_r: config.lambda2_r,
            lambda_omega: config.lambda_omega,
            bound: config.bound,
        }
    }

    /// L1/L2 penalties on the mean of raw weights, accumulating their
    /// gradient into `grad`.
    fn weights(&self, w: &Weights, grad: &mut Weights) -> f64 {
        fn penalize(l1: f64, l2: f64, w: &Array2<f64>, grad: &mut Array2<f64>) -> f64 {
            if w.is_empty() {
                return 0.;
            }
            let size = w.len() as f64;
            let mut value = 0.;

            if l1 > 0. {
                value += l1 * w.fold(0., |a, v| a + v.abs()) / size;
                Zip::from(&mut *grad)
                    .and(w)
                    .for_each(|g, v| *g += l1 * v.signum() * (*v != 0.) as u8 as f64 / size);
            }
            if l2 > 0. {
                value += l2 * w.fold(0., |a, v| a + v * v) / size;
                grad.scaled_add(2. * l2 / size, w);
            }

            value
        }

        penalize(self.lambda1_in, self.lambda2_in, &w.win, &mut grad.win)
            + penalize(self.lambda1_rec, self.lambda2_rec, &w.wrec, &mut grad.wrec)
            + penalize(self.lambda1_out, self.lambda2_out, &w.wout, &mut grad.wout)
    }
}

/// Result of one gradient evaluation.
#[derive(Debug, Clone)]
pub struct Step {
    pub grad: Weights,
    pub costs: Costs,
    /// Weight and rate penalties, not including `omega`.
    pub regs: f64,
    pub omega: f64,
    pub final_state: Array2<f64>,
}

/// Everything needed to evaluate and differentiate the training objective.
#[derive(Debug, Clone)]
pub struct Model {
    pub dynamics: Dynamics,
    pub constraints: Constraints,
    pub regularization: Regularization,
    pub trainables: Trainables,
}

impl Model {
    pub fn effective(&self, w: &Weights) -> Weights {
        self.constraints.effective(w)
    }

    pub fn simulate(
        &self,
        w: &Weights,
        batch: &Minibatch,
        x_init: Option<ArrayView2<f64>>,
    ) -> Trajectory {
        let eff = self.effective(w);
        self.dynamics
            .forward(&eff, batch.inputs.view(), batch.noise.view(), x_init)
    }

    pub fn evaluate(
        &self,
        w: &Weights,
        batch: &Minibatch,
        x_init: Option<ArrayView2<f64>>,
    ) -> (Costs, Trajectory) {
        let traj = self.simulate(w, batch, x_init);
        let costs = self
            .dynamics
            .costs(&traj, batch.targets.view(), batch.mask.view());
        (costs, traj)
    }

    /// Backpropagation through time of loss, penalties and `Omega`.
    pub fn gradient(
        &self,
        w: &Weights,
        batch: &Minibatch,
        x_init: Option<ArrayView2<f64>>,
    ) -> Step {
        let eff = self.effective(w);
        let dynamics = &self.dynamics;
        let reg = &self.regularization;
        let traj = dynamics.forward(&eff, batch.inputs.view(), batch.noise.view(), x_init);
        let costs = dynamics.costs(&traj, batch.targets.view(), batch.mask.view());

        let (steps, size, n) = traj.x.dim();
        let steps = steps - 1;
        let alpha = dynamics.alpha;
        let hidden = dynamics.hidden;

        let masknorm = mask_norm(batch.mask.view());
        let rate_count = (steps * size * n).max(1) as f64;
        let rate_value = match reg.lambda2_r > 0. {
            true => {
                reg.lambda2_r
                    * traj
                        .r
                        .slice(s![1.., .., ..])
                        .fold(0., |a, v| a + v * v)
                    / rate_count
            }
            false => 0.,
        };

        let mut d_eff = Weights::zeros(eff.n_in(), n, eff.n_out());
        let mut g = Array3::<f64>::zeros((steps + 1, size, n));
        let mut g_next = Array2::<f64>::zeros((size, n));

        for t in (1..=steps).rev() {
            let weight = batch.mask.index_axis(Axis(0), t - 1).mapv(|m| m / masknorm);
            let dz = dynamics.output.loss_grad(
                traj.pre.index_axis(Axis(0), t - 1),
                traj.z.index_axis(Axis(0), t - 1),
                batch.targets.index_axis(Axis(0), t - 1),
                weight.view(),
            );

            let r_t = traj.r.index_axis(Axis(0), t);
            d_eff.wout += &dz.t().dot(&r_t);
            d_eff.bout += &dz.sum_axis(Axis(0));

            let mut dr = dz.dot(&eff.wout);
            if reg.lambda2_r > 0. {
                dr.scaled_add(2. * reg.lambda2_r / rate_count, &r_t);
            }
            dr.scaled_add(alpha, &g_next.dot(&eff.wrec));

            let mut g_t = g_next.mapv(|v| (1. - alpha) * v);
            Zip::from(&mut g_t)
                .and(&dr)
                .and(traj.x.index_axis(Axis(0), t))
                .for_each(|g, dr, x| *g += hidden.df(*x) * dr);

            let g_t_t = g_t.t();
            d_eff
                .wrec
                .scaled_add(alpha, &g_t_t.dot(&traj.r.index_axis(Axis(0), t - 1)));
            d_eff
                .win
                .scaled_add(alpha, &g_t_t.dot(&batch.inputs.index_axis(Axis(0), t - 1)));
            d_eff.brec.scaled_add(alpha, &g_t.sum_axis(Axis(0)));

            g.index_axis_mut(Axis(0), t).assign(&g_t);
            g_next = g_t;
        }

        // The initial state feeds step 1 the same way x_{t-1} feeds x_t.
        let mut g0 = g_next.mapv(|v| (1. - alpha) * v);
        let carry = g_next.dot(&eff.wrec);
        Zip::from(&mut g0)
            .and(&carry)
            .and(traj.x.index_axis(Axis(0), 0))
            .for_each(|g, c, x| *g += alpha * hidden.df(*x) * c);
        d_eff.x0 = g0.sum_axis(Axis(0));

        let omega = match reg.lambda_omega > 0. {
            true => self.omega(&eff, &traj, &g, &mut d_eff.wrec),
            false => 0.,
        };

        let mut grad = self.constraints.pullback(w, &d_eff);
        let regs = reg.weights(w, &mut grad) + rate_value;

        Step {
            grad,
            costs,
            regs,
            omega,
            final_state: traj.final_state(),
        }
    }

    /// Vanishing-gradient penalty on how the error gradient norm changes
    /// across one step, holding `g` and the states fixed. Adds
    /// `lambda_omega * dOmega/dWrec_` into `d_wrec` and returns `Omega`.
    fn omega(
        &self,
        eff: &Weights,
        traj: &Trajectory,
        g: &Array3<f64>,
        d_wrec: &mut Array2<f64>,
    ) -> f64 {
        let alpha = self.dynamics.alpha;
        let hidden = self.dynamics.hidden;
        let bound = self.regularization.bound;
        let (steps, size, n) = traj.x.dim();
        let steps = steps - 1;

        let mut total = 0.;
        let mut valid = 0usize;
        let mut coeffs: Vec<(usize, Array2<f64>)> = vec![];

        for t in 2..=steps {
            let g_t = g.index_axis(Axis(0), t);
            let d = traj.x.index_axis(Axis(0), t - 1).mapv(|v| hidden.df(v));

            let mut h = g_t.mapv(|v| (1. - alpha) * v);
            h.scaled_add(alpha, &(&g_t.dot(&eff.wrec) * &d));

            let mut c = Array2::<f64>::zeros((size, n));
            for b in 0..size {
                let den = g_t.row(b).fold(0., |a, v| a + v * v);
                if den <= bound {
                    continue;
                }
                let num = h.row(b).fold(0., |a, v| a + v * v);
                let ratio = num / den - 1.;

                total += ratio * ratio;
                valid += 1;

                let scale = 4. * ratio / den;
                let mut c_b = c.row_mut(b);
                Zip::from(&mut c_b)
                    .and(h.row(b))
                    .and(d.row(b))
                    .for_each(|c, h, d| *c = scale * h * d);
            }

            coeffs.push((t, c));
        }

        if valid == 0 {
            return 0.;
        }

        let k = self.regularization.lambda_omega * alpha / valid as f64;
        for (t, c) in coeffs {
            d_wrec.scaled_add(k, &g.index_axis(Axis(0), t).t().dot(&c));
        }

        total / valid as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::EiPositive;
    use crate::connectivity::Connectivity;
    use crate::dataset::tests::{config, Sign};
    use crate::dataset::Dataset;
    use ndarray_rand::{rand_distr::Normal, RandomExt};
    use rand::{rngs::StdRng, SeedableRng};

    fn random_weights(n_in: usize, n: usize, n_out: usize, seed: u64) -> Weights {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0., 0.4).unwrap();

        Weights {
            win: Array2::random_using((n, n_in), normal, &mut rng),
            wrec: Array2::random_using((n, n), normal, &mut rng),
            wout: Array2::random_using((n_out, n), normal, &mut rng),
            brec: Array1::random_using(n, normal, &mut rng),
            bout: Array1::random_using(n_out, normal, &mut rng),
            x0: Array1::random_using(n, normal, &mut rng),
        }
    }

    fn model(output: OutputActivation, constraints: Constraints, reg: Regularization) -> Model {
        Model {
            dynamics: Dynamics {
                alpha: 0.2,
                hidden: HiddenActivation::Tanh,
                output,
            },
            constraints,
            regularization: reg,
            trainables: Trainables {
                win: true,
                brec: true,
                bout: true,
                x0: true,
            },
        }
    }

    fn batch(n_in: usize, n: usize) -> Minibatch {
        let task = Sign {
            n_in,
            steps: 9,
            masked: true,
            ragged: true,
        };
        let config = config(n_in, n);
        Dataset::new("gradient", 3, &task, &config, 4, false)
            .next_minibatch()
            .unwrap()
    }

    fn objective(model: &Model, w: &Weights, batch: &Minibatch) -> f64 {
        let step = model.gradient(w, batch, None);
        step.costs.loss + step.regs
    }

    fn check_gradients(model: &Model, w: &Weights, batch: &Minibatch) {
        let grad = model.gradient(w, batch, None).grad;
        let h = 1e-6;

        let mut checks: Vec<(&str, f64, f64)> = vec![];
        macro_rules! finite_diff {
            ($field:ident, $ix:expr) => {{
                let mut plus = w.clone();
                plus.$field[$ix] += h;
                let mut minus = w.clone();
                minus.$field[$ix] -= h;
                let numeric = (objective(model, &plus, batch) - objective(model, &minus, batch)) / (2. * h);
                checks.push((stringify!($field), numeric, grad.$field[$ix]));
            }};
        }

        finite_diff!(wrec, [0, 1]);
        finite_diff!(wrec, [2, 3]);
        finite_diff!(win, [1, 0]);
        finite_diff!(wout, [0, 2]);
        finite_diff!(brec, 3);
        finite_diff!(bout, 0);
        finite_diff!(x0, 1);

        for (name, numeric, analytic) in checks {
            assert!(
                (numeric - analytic).abs() < 1e-5 * (1. + numeric.abs()),
                "{name}: numeric {numeric} analytic {analytic}"
            );
        }
    }

    #[test]
    fn bptt_matches_finite_differences() {
        let reg = Regularization {
            lambda2_rec: 0.1,
            lambda1_out: 0.05,
            lambda2_r: 0.3,
            ..Default::default()
        };
        let model = model(OutputActivation::Sigmoid, Constraints::none(), reg);

        check_gradients(&model, &random_weights(2, 4, 1, 1), &batch(2, 4));
    }

    #[test]
    fn bptt_through_dale_constraints() {
        let constraints = Constraints {
            c_rec: Some(Connectivity::new(Array2::<f64>::ones((4, 4)) - Array2::<f64>::eye(4), None).unwrap()),
            ei: Some(ndarray::array![1., 1., 1., -1.]),
            positive: EiPositive::Abs,
            ..Constraints::none()
        };
        let model = model(OutputActivation::Linear, constraints, Regularization::default());

        check_gradients(&model, &random_weights(2, 4, 1, 2), &batch(2, 4));
    }

    #[test]
    fn omega_is_zero_for_a_norm_preserving_step() {
        // With alpha = 1 and an orthogonal Wrec under a linear activation,
        // the error norm is carried unchanged from step to step.
        let mut model = model(
            OutputActivation::Linear,
            Constraints::none(),
            Regularization {
                lambda_omega: 1.,
                bound: 1e-20,
                ..Default::default()
            },
        );
        model.dynamics.alpha = 1.;
        model.dynamics.hidden = HiddenActivation::Linear;

        let mut w = random_weights(2, 2, 1, 3);
        w.wrec = ndarray::array![[0., -1.], [1., 0.]];

        let step = model.gradient(&w, &batch(2, 2), None);
        assert!(step.omega.abs() < 1e-20);
    }

    #[test]
    fn omega_penalizes_contracting_dynamics() {
        let model = model(
            OutputActivation::Linear,
            Constraints::none(),
            Regularization {
                lambda_omega: 1.,
                bound: 1e-20,
                ..Default::default()
            },
        );
        let mut w = random_weights(2, 4, 1, 4);
        w.wrec *= 0.01;

        let step = model.gradient(&w, &batch(2, 4), None);
        assert!(step.omega > 0.);
        assert!(step.grad.is_finite());
    }

    #[test]
    fn dimension_check_names_the_mismatch() {
        let w = Weights::zeros(2, 4, 1);
        assert!(w.check_dims("weights", 2, 4, 1).is_ok());

        match w.check_dims("weights", 2, 5, 1) {
            Err(TrainError::Shape { expected, actual, .. }) => {
                assert_eq!(expected, vec![5, 2]);
                assert_eq!(actual, vec![4, 2]);
            }
            other => panic!("expected shape error, got {other:?}"),
        }
        assert!(w.check_dims("weights", 3, 4, 1).is_err());
        assert!(w.check_dims("weights", 2, 4, 2).is_err());
    }

    #[test]
    fn continuous_state_is_carried() {
        let model = model(OutputActivation::Linear, Constraints::none(), Regularization::default());
        let w = random_weights(2, 4, 1, 5);
        let batch = batch(2, 4);

        let first = model.gradient(&w, &batch, None);
        let (_, traj) = model.evaluate(&w, &batch, Some(first.final_state.view()));
        assert_eq!(traj.x.index_axis(Axis(0), 0), first.final_state);
    }
}
