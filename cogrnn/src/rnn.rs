use ndarray::{Array2, Array3, ArrayView2, Axis};
use ndarray_rand::{rand_distr::Normal, RandomExt};
use rand::rngs::StdRng;
use std::path::Path;

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::dataset::{Dataset, Task, Trial};
use crate::error::{Result, TrainError};
use crate::linalg;
use crate::network::{Model, Trajectory, Weights};
use crate::trainer::Trainer;

/// One simulated trial.
#[derive(Debug, Clone)]
pub struct Run {
    /// Time of each state sample, starting at 0.
    pub t: Vec<f64>,
    /// States, (T + 1) x N.
    pub x: Array2<f64>,
    /// Rates, (T + 1) x N.
    pub r: Array2<f64>,
    /// Outputs, T x Nout.
    pub z: Array2<f64>,
}

impl Run {
    fn from_trajectory(traj: &Trajectory, dt: f64) -> Run {
        Run {
            t: (0..=traj.steps()).map(|k| k as f64 * dt).collect(),
            x: traj.x.index_axis(Axis(1), 0).to_owned(),
            r: traj.r.index_axis(Axis(1), 0).to_owned(),
            z: traj.z.index_axis(Axis(1), 0).to_owned(),
        }
    }
}

/// A trained network loaded for inference.
#[derive(Debug, Clone)]
pub struct Rnn {
    pub config: Config,
    pub settings: Vec<(String, String)>,
    /// Raw weights; constraints are reapplied by `model`.
    pub weights: Weights,
    model: Model,
}

impl Rnn {
    /// Loads the best weights of a checkpoint.
    pub fn load(path: impl AsRef<Path>) -> Result<Rnn> {
        Rnn::from_checkpoint(&Checkpoint::load(path)?, true)
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint, best: bool) -> Result<Rnn> {
        let trainer = Trainer::new(checkpoint.config.clone())?;
        let weights = match best {
            true => checkpoint.best.clone(),
            false => checkpoint.current.clone(),
        };
        let config = &trainer.config;
        weights.check_dims("checkpoint weights", config.n_in, config.n, config.n_out)?;

        Ok(Rnn {
            model: trainer.model(),
            config: trainer.config,
            settings: checkpoint.settings.clone(),
            weights,
        })
    }

    pub fn dt(&self) -> f64 {
        self.config.alpha() * self.config.tau
    }

    /// Weights as the network runs with them.
    pub fn effective(&self) -> Weights {
        self.model.effective(&self.weights)
    }

    /// Runs `inputs` (T x Nin) from `x0`. With `rng`, recurrent noise of
    /// variance `var_rec` is injected.
    pub fn run(&self, inputs: ArrayView2<f64>, rng: Option<&mut StdRng>) -> Result<Run> {
        let n_in = self.weights.n_in();
        if inputs.ncols() != n_in {
            return Err(TrainError::shape("inputs", &[inputs.nrows(), n_in], inputs.shape()));
        }

        let steps = inputs.nrows();
        let n = self.weights.n();
        let inputs = inputs.insert_axis(Axis(1));

        let noise = match rng {
            Some(rng) => {
                let sigma = (2. * self.config.var_rec / self.config.alpha()).sqrt();
                let normal = Normal::new(0., sigma).map_err(|e| TrainError::InvalidParameter {
                    name: "var_rec",
                    reason: e.to_string(),
                })?;
                Array3::random_using((steps, 1, n), normal, rng)
            }
            None => Array3::zeros((steps, 1, n)),
        };

        let traj = self
            .model
            .dynamics
            .forward(&self.effective(), inputs, noise.view(), None);

        Ok(Run::from_trajectory(&traj, self.dt()))
    }

    /// Generates one trial from `task` with the training input conditioning
    /// (baseline, rectification, and noise when `noisy`) and runs it.
    pub fn run_trial(&self, task: &dyn Task, seed: u64, noisy: bool) -> Result<(Trial, Run)> {
        let mut config = self.config.clone();
        if !noisy {
            config.var_in = 0.;
            config.var_rec = 0.;
        }

        let mut dataset = Dataset::new("test", 1, task, &config, seed, true);
        let mut batch = dataset.next_minibatch()?;
        let traj = self.model.simulate(&self.weights, &batch, None);

        let trial = batch.trials.swap_remove(0);
        Ok((trial, Run::from_trajectory(&traj, self.dt())))
    }

    /// Spectral radius of the effective recurrent matrix.
    pub fn spectral_radius(&self) -> Result<f64> {
        linalg::spectral_radius(&self.effective().wrec)
    }
}
