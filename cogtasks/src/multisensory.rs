//! Multisensory integration: a visual, auditory or combined stimulus
//! flickers at a rate, and the network reports whether the rate is above a
//! category boundary. Combined trials carry the same rate on both channels.

use cogrnn::dataset::{Task, Trial, TrialParams};
use cogrnn::{Config, Result};
use ndarray::{Array2, Array3};
use rand::{rngs::StdRng, seq::SliceRandom};

use crate::tools::{choice_performance, ei_labels, tuned, Timeline};
use crate::Experiment;

pub const FMIN: f64 = 9.;
pub const FMAX: f64 = 16.;
pub const BOUNDARY: f64 = 12.5;

pub const VISUAL_P: usize = 0;
pub const VISUAL_N: usize = 1;
pub const AUDITORY_P: usize = 2;
pub const AUDITORY_N: usize = 3;

const HIGH: usize = 0;
const LOW: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Visual,
    Auditory,
    Both,
}

impl Modality {
    const ALL: [Modality; 3] = [Modality::Visual, Modality::Auditory, Modality::Both];

    fn code(self) -> f64 {
        match self {
            Modality::Visual => 0.,
            Modality::Auditory => 1.,
            Modality::Both => 2.,
        }
    }

    fn channels(self) -> &'static [(usize, usize)] {
        match self {
            Modality::Visual => &[(VISUAL_P, VISUAL_N)],
            Modality::Auditory => &[(AUDITORY_P, AUDITORY_N)],
            Modality::Both => &[(VISUAL_P, VISUAL_N), (AUDITORY_P, AUDITORY_N)],
        }
    }
}

pub struct Multisensory {
    pub fixation: f64,
    pub stimulus: f64,
    pub decision: f64,
    pub target_performance: f64,
}

impl Default for Multisensory {
    fn default() -> Multisensory {
        Multisensory {
            fixation: 750.,
            stimulus: 1000.,
            decision: 500.,
            target_performance: 0.85,
        }
    }
}

impl Multisensory {
    pub fn timeline(&self, dt: f64) -> Timeline {
        Timeline::new(
            &[
                ("fixation", self.fixation),
                ("stimulus", self.stimulus),
                ("decision", self.decision),
            ],
            dt,
        )
    }

    pub fn trial(&self, modality: Modality, freq: f64, dt: f64) -> Trial {
        let timeline = self.timeline(dt);
        let mut inputs = Array2::zeros((timeline.steps(), 4));

        for i in timeline.indices("stimulus") {
            for (pos, neg) in modality.channels() {
                inputs[[i, *pos]] = tuned(freq, FMIN, FMAX);
                inputs[[i, *neg]] = tuned(FMAX + FMIN - freq, FMIN, FMAX);
            }
        }

        let choice = if freq > BOUNDARY { HIGH } else { LOW };
        let (outputs, mask) = timeline.choice_targets(2, choice);

        let mut trial = Trial {
            t: timeline.t,
            inputs,
            outputs,
            mask: Some(mask),
            epochs: timeline.epochs,
            ..Default::default()
        };
        trial.info.insert("modality".into(), modality.code());
        trial.info.insert("freq".into(), freq);
        trial.info.insert("choice".into(), choice as f64);

        trial
    }
}

impl Task for Multisensory {
    fn generate_trial(&self, rng: &mut StdRng, dt: f64, _: &TrialParams) -> Result<Trial> {
        let freqs = (FMIN as usize..=FMAX as usize).map(|f| f as f64).collect::<Vec<f64>>();

        let modality = *Modality::ALL.choose(rng).unwrap_or(&Modality::Both);
        let freq = *freqs.choose(rng).unwrap_or(&FMIN);

        Ok(self.trial(modality, freq, dt))
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

impl Experiment for Multisensory {
    fn name(&self) -> &'static str {
        "multisensory"
    }

    fn config(&self) -> Config {
        let mut config = Config::new();
        config.n_in = 4;
        config.n = 150;
        config.n_out = 2;
        config.ei = Some(ei_labels(config.n, 0.8));
        config.var_in = 0.01;
        config.var_rec = 0.01;
        config.lambda2_r = 1.;
        config.n_validation = 200;
        config.checkfreq = Some(100);
        config
    }

    fn task(&self) -> &dyn Task {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn unimodal_trials_leave_other_channels_silent() {
        let task = Multisensory::default();
        let trial = task.trial(Modality::Visual, 16., 25.);

        let stim = trial.epoch_indices("stimulus");
        assert_eq!(stim.len(), 40);
        for i in stim {
            assert!((trial.inputs[[i, VISUAL_P]] - 1.2).abs() < 1e-12);
            assert_eq!(trial.inputs[[i, AUDITORY_P]], 0.);
            assert_eq!(trial.inputs[[i, AUDITORY_N]], 0.);
        }
        assert_eq!(trial.info["choice"], HIGH as f64);
    }

    #[test]
    fn multisensory_trials_drive_both_channels() {
        let task = Multisensory::default();
        let trial = task.trial(Modality::Both, 10., 25.);
        let i = trial.epoch_indices("stimulus")[0];

        assert_eq!(trial.inputs[[i, VISUAL_P]], trial.inputs[[i, AUDITORY_P]]);
        assert_eq!(trial.inputs[[i, VISUAL_N]], trial.inputs[[i, AUDITORY_N]]);
        assert_eq!(trial.info["choice"], LOW as f64);
    }

    #[test]
    fn generated_trials_cover_every_modality() {
        let task = Multisensory::default();
        let mut rng = StdRng::seed_from_u64(12);
        let params = TrialParams { name: "gradient", minibatch_index: 0, index: 0 };

        let mut seen = [false; 3];
        for _ in 0..60 {
            let trial = task.generate_trial(&mut rng, 20., &params).unwrap();
            seen[trial.info["modality"] as usize] = true;
            assert!(trial.info["freq"] != BOUNDARY);
        }
        assert_eq!(seen, [true; 3]);
    }
}
