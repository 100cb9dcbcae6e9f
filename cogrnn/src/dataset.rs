use ndarray::{s, Array2, Array3};
use ndarray_rand::{rand_distr::Normal, RandomExt};
use rand::{rngs::StdRng, SeedableRng};
use std::collections::BTreeMap;

use crate::config::Config;
use crate::error::{Result, TrainError};

const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// What a task sees when asked for a trial.
#[derive(Debug, Clone, Copy)]
pub struct TrialParams<'a> {
    pub name: &'a str,
    pub minibatch_index: u64,
    pub index: usize,
}

/// One trial: inputs and targets sampled at the time points `t`.
#[derive(Debug, Clone, Default)]
pub struct Trial {
    pub t: Vec<f64>,
    /// (time, inputs)
    pub inputs: Array2<f64>,
    /// (time, outputs)
    pub outputs: Array2<f64>,
    /// (time, outputs); `None` means every output counts at every time point.
    pub mask: Option<Array2<f64>>,
    pub epochs: BTreeMap<String, (f64, f64)>,
    pub info: BTreeMap<String, f64>,
}

impl Trial {
    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    /// Indices of `t` that fall inside the named epoch.
    pub fn epoch_indices(&self, name: &str) -> Vec<usize> {
        match self.epochs.get(name) {
            Some((start, end)) => self
                .t
                .iter()
                .enumerate()
                .filter(|(_, t)| *start <= **t && **t < *end)
                .map(|(i, _)| i)
                .collect(),
            None => vec![],
        }
    }
}

/// A task supplies trials and, optionally, a behavioral performance measure
/// used to decide when training is done.
pub trait Task {
    fn generate_trial(&self, rng: &mut StdRng, dt: f64, params: &TrialParams) -> Result<Trial>;

    /// Performance on a set of trials given the network outputs, shape
    /// (time, trials, outputs).
    fn performance(&self, _trials: &[Trial], _z: &Array3<f64>) -> Option<f64> {
        None
    }

    fn terminate(&self, _performance_history: &[f64]) -> bool {
        false
    }
}

/// Network-ready tensors for a set of trials, all shaped (time, trials, units).
#[derive(Debug, Clone)]
pub struct Minibatch {
    pub inputs: Array3<f64>,
    pub noise: Array3<f64>,
    pub targets: Array3<f64>,
    pub mask: Array3<f64>,
    pub trials: Vec<Trial>,
}

impl Minibatch {
    pub fn steps(&self) -> usize {
        self.targets.dim().0
    }

    pub fn size(&self) -> usize {
        self.targets.dim().1
    }
}

#[derive(Debug, Clone)]
struct Conditioning {
    n_in: usize,
    n: usize,
    n_out: usize,
    dt: f64,
    baseline_in: f64,
    sigma_in: f64,
    sigma_rec: f64,
    rectify_inputs: bool,
}

impl Conditioning {
    fn from_config(config: &Config) -> Conditioning {
        let alpha = config.alpha();

        Conditioning {
            n_in: config.n_in,
            n: config.n,
            n_out: config.n_out,
            dt: config.dt.unwrap_or(config.tau / 5.),
            baseline_in: config.baseline_in,
            sigma_in: (2. * config.var_in / alpha).sqrt(),
            sigma_rec: (2. * config.var_rec / alpha).sqrt(),
            rectify_inputs: config.rectify_inputs,
        }
    }

    fn check(&self, trial: &Trial) -> Result<()> {
        let steps = trial.len();

        if trial.inputs.dim() != (steps, self.n_in) {
            return Err(TrainError::Task(format!(
                "inputs have shape {:?}, expected ({steps}, {})",
                trial.inputs.dim(),
                self.n_in
            )));
        }
        if trial.outputs.dim() != (steps, self.n_out) {
            return Err(TrainError::Task(format!(
                "outputs have shape {:?}, expected ({steps}, {})",
                trial.outputs.dim(),
                self.n_out
            )));
        }
        if let Some(mask) = &trial.mask {
            if mask.dim() != trial.outputs.dim() {
                return Err(TrainError::Task(format!(
                    "mask has shape {:?}, outputs {:?}",
                    mask.dim(),
                    trial.outputs.dim()
                )));
            }
        }

        Ok(())
    }

    fn noise(&self, shape: (usize, usize, usize), sigma: f64, rng: &mut StdRng) -> Array3<f64> {
        match Normal::new(0., sigma) {
            Ok(normal) if sigma > 0. => Array3::random_using(shape, normal, rng),
            _ => Array3::zeros(shape),
        }
    }

    /// Pads trials to a common length and adds input baseline and noise.
    fn minibatch(&self, trials: Vec<Trial>, rng: &mut StdRng) -> Minibatch {
        let steps = trials.iter().map(|t| t.len()).max().unwrap_or(0);
        let size = trials.len();

        let mut inputs = Array3::zeros((steps, size, self.n_in));
        let mut targets = Array3::zeros((steps, size, self.n_out));
        let mut mask = Array3::zeros((steps, size, self.n_out));

        let input_noise = self.noise((steps, size, self.n_in), self.sigma_in, rng);

        for (b, trial) in trials.iter().enumerate() {
            let len = trial.len();

            let mut u = trial.inputs.clone();
            u += self.baseline_in;
            u += &input_noise.slice(s![..len, b, ..]);
            if self.rectify_inputs {
                u.mapv_inplace(|v| v.max(0.));
            }
            inputs.slice_mut(s![..len, b, ..]).assign(&u);

            targets.slice_mut(s![..len, b, ..]).assign(&trial.outputs);
            match &trial.mask {
                Some(m) => mask.slice_mut(s![..len, b, ..]).assign(m),
                None => mask.slice_mut(s![..len, b, ..]).fill(1.),
            }
        }

        let noise = self.noise((steps, size, self.n), self.sigma_rec, rng);

        Minibatch {
            inputs,
            noise,
            targets,
            mask,
            trials,
        }
    }
}

/// Restartable source of minibatches drawn from a task.
///
/// Every call builds a fresh RNG from the dataset seed. A `reproducible`
/// dataset uses the same seed on every call, so it always yields the same
/// trials; otherwise the seed advances with the call counter.
pub struct Dataset<'a> {
    pub name: String,
    pub minibatch_size: usize,
    task: &'a dyn Task,
    seed: u64,
    reproducible: bool,
    calls: u64,
    conditioning: Conditioning,
}

impl<'a> Dataset<'a> {
    pub fn new(
        name: &str,
        size: usize,
        task: &'a dyn Task,
        config: &Config,
        seed: u64,
        reproducible: bool,
    ) -> Dataset<'a> {
        Dataset {
            name: name.into(),
            minibatch_size: size,
            task,
            seed,
            reproducible,
            calls: 0,
            conditioning: Conditioning::from_config(config),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn set_calls(&mut self, calls: u64) {
        self.calls = calls;
    }

    fn rng_for_call(&self) -> StdRng {
        let seed = match self.reproducible {
            true => self.seed,
            false => self
                .seed
                .wrapping_add(self.calls.wrapping_add(1).wrapping_mul(SEED_STRIDE)),
        };
        StdRng::seed_from_u64(seed)
    }

    fn generate(&self, rng: &mut StdRng) -> Result<Vec<Trial>> {
        (0..self.minibatch_size)
            .map(|index| {
                let params = TrialParams {
                    name: &self.name,
                    minibatch_index: self.calls,
                    index,
                };
                let trial = self
                    .task
                    .generate_trial(rng, self.conditioning.dt, &params)?;
                self.conditioning.check(&trial)?;
                Ok(trial)
            })
            .collect()
    }

    /// Next minibatch of `minibatch_size` trials.
    pub fn next_minibatch(&mut self) -> Result<Minibatch> {
        let mut rng = self.rng_for_call();
        let trials = self.generate(&mut rng)?;
        self.calls += 1;

        Ok(self.conditioning.minibatch(trials, &mut rng))
    }

    /// Same trials as [`Dataset::next_minibatch`], split into chunks of at most
    /// `batch_size` trials.
    pub fn next_chunked(&mut self, batch_size: usize) -> Result<Vec<Minibatch>> {
        let mut rng = self.rng_for_call();
        let mut trials = self.generate(&mut rng)?;
        self.calls += 1;

        let batch_size = batch_size.max(1);
        let mut chunks = vec![];
        while !trials.is_empty() {
            let rest = trials.split_off(batch_size.min(trials.len()));
            chunks.push(self.conditioning.minibatch(trials, &mut rng));
            trials = rest;
        }

        Ok(chunks)
    }

    /// Whether the task defines an output mask. Uses its own RNG so the
    /// dataset's sequence is unaffected.
    pub fn has_output_mask(&self) -> Result<bool> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let params = TrialParams {
            name: &self.name,
            minibatch_index: 0,
            index: 0,
        };
        let trial = self
            .task
            .generate_trial(&mut rng, self.conditioning.dt, &params)?;

        Ok(trial.mask.is_some())
    }
}
