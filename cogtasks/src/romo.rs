//! Parametric working memory: two vibrotactile frequencies separated by a
//! delay, and the network reports whether the first was higher.

use cogrnn::dataset::{Task, Trial, TrialParams};
use cogrnn::{Config, Result};
use ndarray::{Array2, Array3};
use rand::{rngs::StdRng, seq::SliceRandom, Rng};

use crate::tools::{choice_performance, ei_labels, tuned, Timeline};
use crate::Experiment;

pub const FMIN: f64 = 10.;
pub const FMAX: f64 = 34.;

/// Lower frequency of each pair; the higher one is 8 Hz above.
const FLOWS: [f64; 5] = [10., 14., 18., 22., 26.];
const FGAP: f64 = 8.;

const POS: usize = 0;
const NEG: usize = 1;

const F1_HIGHER: usize = 0;
const F1_LOWER: usize = 1;

pub struct Romo {
    pub fixation: f64,
    pub stimulus: f64,
    pub delay: f64,
    pub decision: f64,
    /// Performance at which training stops.
    pub target_performance: f64,
}

impl Default for Romo {
    fn default() -> Romo {
        Romo {
            fixation: 500.,
            stimulus: 500.,
            delay: 3000.,
            decision: 300.,
            target_performance: 0.85,
        }
    }
}

impl Romo {
    pub fn timeline(&self, dt: f64) -> Timeline {
        Timeline::new(
            &[
                ("fixation", self.fixation),
                ("f1", self.stimulus),
                ("delay", self.delay),
                ("f2", self.stimulus),
                ("decision", self.decision),
            ],
            dt,
        )
    }

    /// Builds the trial for a frequency pair; `choice` is derived from it.
    pub fn trial(&self, f1: f64, f2: f64, dt: f64) -> Trial {
        let timeline = self.timeline(dt);
        let mut inputs = Array2::zeros((timeline.steps(), 2));

        for (epoch, f) in [("f1", f1), ("f2", f2)] {
            for i in timeline.indices(epoch) {
                inputs[[i, POS]] = tuned(f, FMIN, FMAX);
                inputs[[i, NEG]] = tuned(FMAX + FMIN - f, FMIN, FMAX);
            }
        }

        let choice = if f1 > f2 { F1_HIGHER } else { F1_LOWER };
        let (outputs, mask) = timeline.choice_targets(2, choice);

        let mut trial = Trial {
            t: timeline.t,
            inputs,
            outputs,
            mask: Some(mask),
            epochs: timeline.epochs,
            ..Default::default()
        };
        trial.info.insert("f1".into(), f1);
        trial.info.insert("f2".into(), f2);
        trial.info.insert("choice".into(), choice as f64);

        trial
    }
}

impl Task for Romo {
    fn generate_trial(&self, rng: &mut StdRng, dt: f64, _: &TrialParams) -> Result<Trial> {
        let low = *FLOWS.choose(rng).unwrap_or(&FMIN);
        let (f1, f2) = match rng.gen::<bool>() {
            true => (low + FGAP, low),
            false => (low, low + FGAP),
        };

        Ok(self.trial(f1, f2, dt))
    }

    fn performance(&self, trials: &[Trial], z: &Array3<f64>) -> Option<f64> {
        choice_performance(trials, z)
    }

    fn terminate(&self, performance_history: &[f64]) -> bool {
        performance_history
            .last()
            .is_some_and(|p| *p >= self.target_performance)
    }
}

impl Experiment for Romo {
    fn name(&self) -> &'static str {
        "romo"
    }

    fn config(&self) -> Config {
        let mut config = Config::new();
        config.n_in = 2;
        config.n = 100;
        config.n_out = 2;
        config.ei = Some(ei_labels(config.n, 0.8));
        config.lambda2_in = 1.;
        config.lambda2_rec = 1.;
        config.lambda2_out = 1.;
        config.lambda2_r = 1.;
        config.var_rec = 0.01;
        config.n_validation = 200;
        config.checkfreq = Some(100);
        config
    }

    fn task(&self) -> &dyn Task {
        self
    }
}
