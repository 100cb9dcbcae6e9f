use ndarray::{Array1, Array2};
use ndarray_rand::rand_distr::{Distribution as _, Gamma, LogNormal, StandardNormal, Uniform};
use rand::{rngs::StdRng, SeedableRng};
use std::{fmt, fs, path::Path, str::FromStr};
use tracing::{info, warn};

use crate::activation::{EiPositive, HiddenActivation, OutputActivation};
use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::constraints::Constraints;
use crate::dataset::{Dataset, Task};
use crate::error::{Result, TrainError};
use crate::linalg;
use crate::network::{Dynamics, Model, Regularization, Trainables, Weights};
use crate::sgd::{Report, Sgd, SgdOptions};

/// Target spectral radius for networks without E/I structure.
const RHO_DEFAULT: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Uniform,
    Normal,
    Gamma,
    Lognormal,
}

impl FromStr for Distribution {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uniform" => Ok(Distribution::Uniform),
            "normal" => Ok(Distribution::Normal),
            "gamma" => Ok(Distribution::Gamma),
            "lognormal" => Ok(Distribution::Lognormal),
            other => Err(TrainError::UnknownDistribution(other.into())),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Distribution::Uniform => "uniform",
            Distribution::Normal => "normal",
            Distribution::Gamma => "gamma",
            Distribution::Lognormal => "lognormal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Batch,
    Continuous,
}

impl FromStr for Mode {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "batch" => Ok(Mode::Batch),
            "continuous" => Ok(Mode::Continuous),
            other => Err(TrainError::UnknownMode(other.into())),
        }
    }
}

/// Builds a constrained network for a task and trains it.
///
/// Construction resolves defaults and rejects unknown names, so every
/// configuration error surfaces before any weights are drawn.
#[derive(Debug, Clone)]
pub struct Trainer {
    pub config: Config,
    pub mode: Mode,
    pub hidden: HiddenActivation,
    pub output: OutputActivation,
    pub positive: EiPositive,
    pub distribution_in: Distribution,
    pub distribution_rec: Distribution,
    pub distribution_out: Distribution,
}

/// Default recurrent mask. With E/I labels each unit receives every
/// excitatory unit at weight 1 and every inhibitory unit at a weight that
/// balances the excitatory count; self connections are excluded either way.
fn default_c_rec(n: usize, ei: Option<&[f64]>) -> Result<Connectivity> {
    let mut c = Array2::ones((n, n));

    if let Some(ei) = ei {
        let exc = ei.iter().filter(|v| **v > 0.).count();
        let inh = ei.len() - exc;

        for i in 0..n {
            let n_exc = exc - (ei[i] > 0.) as usize;
            for j in 0..n {
                c[[i, j]] = match ei[j] > 0. {
                    true => 1.,
                    false if inh > 0 => n_exc as f64 / inh as f64,
                    false => 0.,
                };
            }
        }
    }

    for i in 0..n {
        c[[i, i]] = 0.;
    }

    Connectivity::new(c, None)
}

fn sparseness(c: &Connectivity) -> String {
    format!("p = {:.2}, p_plastic = {:.2}", c.p, c.p_plastic)
}

fn check_dim(what: &'static str, c: &Option<Connectivity>, dim: (usize, usize)) -> Result<()> {
    match c {
        Some(c) if c.dim() != dim => Err(TrainError::shape(what, &[dim.0, dim.1], &[c.dim().0, c.dim().1])),
        _ => Ok(()),
    }
}

impl Trainer {
    pub fn new(mut config: Config) -> Result<Trainer> {
        if config.n_out == 0 {
            return Err(TrainError::MissingParameter("n_out"));
        }
        if config.n == 0 {
            return Err(TrainError::InvalidParameter {
                name: "n",
                reason: "network needs at least one unit".into(),
            });
        }
        if !(config.tau > 0.) {
            return Err(TrainError::InvalidParameter {
                name: "tau",
                reason: format!("must be positive, got {}", config.tau),
            });
        }

        let sizes = [
            ("n_gradient", config.n_gradient),
            ("n_validation", config.n_validation),
            ("batch_size", config.batch_size),
        ];
        for (name, size) in sizes {
            if size == 0 {
                return Err(TrainError::InvalidParameter {
                    name,
                    reason: "must be at least 1".into(),
                });
            }
        }

        if let Some(ei) = &config.ei {
            if ei.len() != config.n {
                return Err(TrainError::shape("ei", &[config.n], &[ei.len()]));
            }
            if ei.iter().any(|v| *v == 0. || !v.is_finite()) {
                return Err(TrainError::InvalidParameter {
                    name: "ei",
                    reason: "labels must be positive (excitatory) or negative (inhibitory)".into(),
                });
            }
        }

        if config.dt.is_none() {
            config.dt = Some(config.tau / 5.);
        }

        let has_ei = config.ei.is_some();
        let distribution_in = config
            .distribution_in
            .get_or_insert_with(|| "uniform".into())
            .parse()?;
        let distribution_rec = config
            .distribution_rec
            .get_or_insert_with(|| match has_ei {
                true => "gamma".into(),
                false => "normal".into(),
            })
            .parse()?;
        let distribution_out = config
            .distribution_out
            .get_or_insert_with(|| "uniform".into())
            .parse()?;

        let positive = config.ei_positive_func.parse()?;
        let hidden = config.hidden_activation.parse()?;
        let output = config.output_activation.parse()?;
        let mode = config.mode.parse()?;

        if mode == Mode::Continuous {
            if config.n_gradient != 1 {
                warn!(n_gradient = config.n_gradient, "continuous mode, setting n_gradient to 1");
                config.n_gradient = 1;
            }
            config.train_x0 = false;
        }

        if config.c_rec.is_none() {
            config.c_rec = Some(default_c_rec(config.n, config.ei.as_deref())?);
        }

        check_dim("c_in", &config.c_in, (config.n, config.n_in))?;
        check_dim("c_rec", &config.c_rec, (config.n, config.n))?;
        check_dim("c_out", &config.c_out, (config.n_out, config.n))?;

        Ok(Trainer {
            config,
            mode,
            hidden,
            output,
            positive,
            distribution_in,
            distribution_rec,
            distribution_out,
        })
    }

    /// Samples an `m` by `n` weight matrix. With a connectivity, one value is
    /// drawn per plastic entry, scaled by its mask value, and every other
    /// entry is zero.
    pub fn init_weights(
        rng: &mut StdRng,
        c: Option<&Connectivity>,
        m: usize,
        n: usize,
        distribution: Distribution,
    ) -> Result<Array2<f64>> {
        let (scale, idx) = match c {
            Some(c) => (c.plastic.clone(), Some(&c.idx_plastic)),
            None => (Array1::ones(m * n), None),
        };

        let invalid = |reason: String| TrainError::InvalidParameter {
            name: "distribution",
            reason,
        };

        let uniform = Uniform::new_inclusive(-1., 1.);
        let gamma = Gamma::new(2., 0.05).map_err(|e| invalid(format!("gamma: {}", e)))?;

        let mut samples = Vec::with_capacity(scale.len());
        for mask in scale.iter().copied() {
            let value = match distribution {
                Distribution::Uniform => 0.1 * mask * uniform.sample(rng),
                Distribution::Normal => {
                    let z: f64 = StandardNormal.sample(rng);
                    mask * z
                }
                Distribution::Gamma => mask * gamma.sample(rng),
                Distribution::Lognormal => {
                    let mean = 0.5 * mask;
                    let var = 0.1;
                    let ratio = 1. + var / (mean * mean);
                    let mu = (mean / ratio.sqrt()).ln();
                    let sigma = ratio.ln().sqrt();
                    LogNormal::new(mu, sigma)
                        .map_err(|e| invalid(format!("lognormal for mask value {}: {}", mask, e)))?
                        .sample(rng)
                }
            };
            samples.push(value);
        }

        let mut w = Array1::zeros(m * n);
        match idx {
            Some(idx) => {
                for (ix, value) in idx.iter().zip(samples) {
                    w[*ix] = value;
                }
            }
            None => w.assign(&Array1::from(samples)),
        }

        w.into_shape_with_order((m, n))
            .map_err(|_| TrainError::shape("initial weights", &[m, n], &[m * n]))
    }

    fn trainables(&self) -> Trainables {
        Trainables {
            win: self.config.n_in > 0,
            brec: self.config.train_brec,
            bout: self.config.train_bout,
            x0: self.config.train_x0 && self.mode == Mode::Batch,
        }
    }

    pub fn constraints(&self) -> Constraints {
        Constraints {
            c_in: self.config.c_in.clone(),
            c_rec: self.config.c_rec.clone(),
            c_out: self.config.c_out.clone(),
            ei: self.config.ei.clone().map(Array1::from),
            positive: self.positive,
        }
    }

    pub fn model(&self) -> Model {
        Model {
            dynamics: Dynamics {
                alpha: self.config.alpha(),
                hidden: self.hidden,
                output: self.output,
            },
            constraints: self.constraints(),
            regularization: Regularization::from_config(&self.config),
            trainables: self.trainables(),
        }
    }

    /// Draws initial weights, applies Dale's Law and rescales the recurrent
    /// matrix to the target spectral radius. Rescaling also applies to the
    /// fixed part of the recurrent connectivity stored in the config.
    pub fn initialize(&mut self) -> Result<(Weights, Vec<(String, String)>)> {
        let config = &self.config;
        let (n_in, n, n_out) = (config.n_in, config.n, config.n_out);
        let mut settings: Vec<(String, String)> = vec![];
        let mut set = |k: &str, v: String| settings.push((k.into(), v));

        set("init seed", config.seed.to_string());
        let mut rng = StdRng::seed_from_u64(config.seed);

        set("distribution (Win)", self.distribution_in.to_string());
        set("distribution (Wrec)", self.distribution_rec.to_string());
        set("distribution (Wout)", self.distribution_out.to_string());

        let mut win = Trainer::init_weights(&mut rng, config.c_in.as_ref(), n, n_in, self.distribution_in)?;
        let mut wrec = Trainer::init_weights(&mut rng, config.c_rec.as_ref(), n, n, self.distribution_rec)?;
        let mut wout =
            Trainer::init_weights(&mut rng, config.c_out.as_ref(), n_out, n, self.distribution_out)?;

        set("Nin/N/Nout", format!("{}/{}/{}", n_in, n, n_out));

        match &config.ei {
            Some(ei) => {
                let n_exc = ei.iter().filter(|v| **v > 0.).count();
                set("Dale's Law", format!("E/I = {}/{}", n_exc, ei.len() - n_exc));

                win.mapv_inplace(f64::abs);
                wrec.mapv_inplace(f64::abs);
                wout.mapv_inplace(f64::abs);
            }
            None => set("Dale's Law", "no".into()),
        }

        let target = match config.ei {
            Some(_) => config.rho0,
            None => RHO_DEFAULT,
        };
        let rho = linalg::spectral_radius(&self.constraints().full_recurrent(&wrec))?;

        if rho > 0. {
            let factor = target / rho;
            wrec *= factor;
            if let Some(c_rec) = self.config.c_rec.as_mut() {
                c_rec.scale_fixed(factor);
            }
        } else {
            warn!("recurrent matrix has zero spectral radius, skipping normalization");
        }

        let rho = linalg::spectral_radius(&self.constraints().full_recurrent(&wrec))?;
        set("initial spectral radius", format!("{:.2}", rho));

        let config = &self.config;
        let weights = Weights {
            win,
            wrec,
            wout,
            brec: Array1::from_elem(n, config.brec),
            bout: Array1::from_elem(n_out, config.bout),
            x0: Array1::from_elem(n, config.x0),
        };

        Ok((weights, settings))
    }

    fn run_settings(&self, task: &dyn Task) -> Result<Vec<(String, String)>> {
        let config = &self.config;
        let trainables = self.trainables();
        let yes_no = |b: bool| if b { "yes" } else { "no" }.to_string();

        let mut settings: Vec<(String, String)> = vec![];
        let mut set = |k: &str, v: String| settings.push((k.into(), v));

        set("train recurrent bias", yes_no(trainables.brec));
        set("train output bias", yes_no(trainables.bout));
        set("train initial conditions", yes_no(trainables.x0));

        if config.n_in > 0 {
            if let Some(c) = &config.c_in {
                set("sparseness (Win)", sparseness(c));
            }
        }
        if let Some(c) = &config.c_rec {
            set("sparseness (Wrec)", sparseness(c));
        }
        if let Some(c) = &config.c_out {
            set("sparseness (Wout)", sparseness(c));
        }

        if config.ei.is_some() {
            set("E/I positivity function", self.positive.name().into());
        }

        set("hidden activation", self.hidden.to_string());
        set(
            "output activation/loss",
            format!("{}/{}", self.output.name(), self.output.loss_name()),
        );
        set(
            "mode",
            match self.mode {
                Mode::Batch => "batch".into(),
                Mode::Continuous => "continuous".into(),
            },
        );

        let sample = Dataset::new("gradient", 1, task, config, config.gradient_seed, false);
        set("output mask", yes_no(sample.has_output_mask()?));

        let lambdas = [
            ("L1 weight regularization (Win)", "lambda1_in", config.lambda1_in, config.n_in > 0),
            ("L1 weight regularization (Wrec)", "lambda1_rec", config.lambda1_rec, true),
            ("L1 weight regularization (Wout)", "lambda1_out", config.lambda1_out, true),
            ("L2 weight regularization (Win)", "lambda2_in", config.lambda2_in, config.n_in > 0),
            ("L2 weight regularization (Wrec)", "lambda2_rec", config.lambda2_rec, true),
            ("L2 weight regularization (Wout)", "lambda2_out", config.lambda2_out, true),
            ("L2 rate regularization", "lambda2_r", config.lambda2_r, true),
        ];
        for (label, name, value, applies) in lambdas {
            if applies && value > 0. {
                set(label, format!("{} = {}", name, value));
            }
        }

        set("sigma_in", format!("{}", config.var_in.sqrt()));
        set("sigma_rec", format!("{}", config.var_rec.sqrt()));
        set("rectify inputs", config.rectify_inputs.to_string());
        set("gradient minibatch size", config.n_gradient.to_string());
        set("validation minibatch size", config.n_validation.to_string());

        set("dt", format!("{} ms", config.alpha() * config.tau));
        set("tau", format!("{} ms", config.tau));
        set("learning rate", config.learning_rate.to_string());
        set("lambda_Omega", config.lambda_omega.to_string());
        set("max gradient norm", config.max_gradient_norm.to_string());

        Ok(settings)
    }

    fn options(&self) -> SgdOptions {
        let config = &self.config;

        SgdOptions {
            learning_rate: config.learning_rate,
            max_gradient_norm: config.max_gradient_norm,
            min_error: config.min_error,
            max_iter: config.max_iter,
            checkfreq: config
                .checkfreq
                .unwrap_or_else(|| (10_000 / config.n_gradient.max(1)).max(1)),
            patience: config.patience,
            batch_size: config.batch_size,
            continuous: self.mode == Mode::Continuous,
        }
    }

    /// Trains on `task`, checkpointing to `savefile`. With `recover`, an
    /// existing checkpoint is resumed; otherwise it is removed first.
    pub fn train(&mut self, savefile: impl AsRef<Path>, task: &dyn Task, recover: bool) -> Result<Report> {
        let savefile = savefile.as_ref();

        if !recover && savefile.exists() {
            fs::remove_file(savefile)?;
        }

        let resume = match recover && savefile.exists() {
            true => Some(Checkpoint::load(savefile)?),
            false => None,
        };

        let (init, settings) = match &resume {
            Some(checkpoint) => {
                let (n_in, n, n_out) = (self.config.n_in, self.config.n, self.config.n_out);
                checkpoint.current.check_dims("checkpoint weights", n_in, n, n_out)?;
                checkpoint.best.check_dims("checkpoint best weights", n_in, n, n_out)?;
                if let Some(state) = &checkpoint.state.continuous_state {
                    if state.ncols() != n {
                        return Err(TrainError::shape("continuous state", &[1, n], state.shape()));
                    }
                }
                check_dim("c_in", &checkpoint.config.c_in, (n, n_in))?;
                check_dim("c_rec", &checkpoint.config.c_rec, (n, n))?;
                check_dim("c_out", &checkpoint.config.c_out, (n_out, n))?;

                self.config.c_in = checkpoint.config.c_in.clone();
                self.config.c_rec = checkpoint.config.c_rec.clone();
                self.config.c_out = checkpoint.config.c_out.clone();
                (checkpoint.current.clone(), checkpoint.settings.clone())
            }
            None => {
                let (weights, mut settings) = self.initialize()?;
                settings.extend(self.run_settings(task)?);
                (weights, settings)
            }
        };

        for (name, value) in settings.iter() {
            info!("{:<34} {}", name, value);
        }

        let config = &self.config;
        let mut gradient_data = Dataset::new(
            "gradient",
            config.n_gradient,
            task,
            config,
            config.gradient_seed,
            false,
        );
        let mut validation_data = Dataset::new(
            "validation",
            config.n_validation,
            task,
            config,
            config.validation_seed,
            true,
        );

        let model = self.model();
        let sgd = Sgd {
            model: &model,
            task,
            options: self.options(),
            config,
            settings: &settings,
        };

        sgd.train(init, &mut gradient_data, &mut validation_data, savefile, resume)
    }
}
