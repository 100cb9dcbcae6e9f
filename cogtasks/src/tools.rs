use cogrnn::dataset::Trial;
use ndarray::{s, Array2, Array3, Axis};
use std::collections::BTreeMap;

/// Target level for the chosen output during the decision.
pub const TARGET_HI: f64 = 1.0;
/// Target level for every other output, and for all outputs at fixation.
pub const TARGET_LO: f64 = 0.2;

/// Excitatory/inhibitory labels with the first `round(n * frac_exc)` units
/// excitatory.
pub fn ei_labels(n: usize, frac_exc: f64) -> Vec<f64> {
    let n_exc = (n as f64 * frac_exc).round() as usize;
    (0..n).map(|i| if i < n_exc { 1. } else { -1. }).collect()
}

/// Maps `x` in `[lo, hi]` linearly onto `[0.4, 1.2]`, the firing range used
/// for tuned input channels.
pub fn tuned(x: f64, lo: f64, hi: f64) -> f64 {
    0.4 + 0.8 * (x - lo) / (hi - lo)
}

/// Consecutive named epochs laid out on a `dt` grid.
pub struct Timeline {
    pub t: Vec<f64>,
    pub epochs: BTreeMap<String, (f64, f64)>,
}

impl Timeline {
    pub fn new(durations: &[(&str, f64)], dt: f64) -> Timeline {
        let mut epochs = BTreeMap::new();
        let mut start = 0.;

        for (name, duration) in durations {
            epochs.insert(name.to_string(), (start, start + duration));
            start += duration;
        }

        let steps = (start / dt).ceil() as usize;
        let t = (0..steps).map(|k| k as f64 * dt).collect();

        Timeline { t, epochs }
    }

    pub fn steps(&self) -> usize {
        self.t.len()
    }

    /// Indices of time points within the named epoch.
    pub fn indices(&self, name: &str) -> Vec<usize> {
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

    /// Two-alternative targets: low everywhere during fixation, high on
    /// `choice` during the decision. Only those two epochs are scored.
    pub fn choice_targets(&self, n_out: usize, choice: usize) -> (Array2<f64>, Array2<f64>) {
        let steps = self.steps();
        let mut outputs = Array2::zeros((steps, n_out));
        let mut mask = Array2::zeros((steps, n_out));

        for i in self.indices("fixation") {
            outputs.row_mut(i).fill(TARGET_LO);
            mask.row_mut(i).fill(1.);
        }
        for i in self.indices("decision") {
            outputs.row_mut(i).fill(TARGET_LO);
            outputs[[i, choice]] = TARGET_HI;
            mask.row_mut(i).fill(1.);
        }

        (outputs, mask)
    }
}

/// Output with the largest mean over the decision epoch of trial `b`, or
/// `None` when the trial has no decision epoch.
pub fn decision(trial: &Trial, z: &Array3<f64>, b: usize) -> Option<usize> {
    let idx = trial.epoch_indices("decision");
    if idx.is_empty() {
        return None;
    }

    let (first, last) = (idx[0], idx[idx.len() - 1]);
    let mean = z
        .slice(s![first..=last, b, ..])
        .mean_axis(Axis(0))?;

    mean.iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (k, v)| match best {
            Some((_, m)) if m >= *v => best,
            _ => Some((k, *v)),
        })
        .map(|(k, _)| k)
}

/// Fraction of trials where the decision matches `info["choice"]`.
pub fn choice_performance(trials: &[Trial], z: &Array3<f64>) -> Option<f64> {
    if trials.is_empty() {
        return None;
    }

    let correct = trials
        .iter()
        .enumerate()
        .filter(|(b, trial)| {
            let expected = trial.info.get("choice").map(|c| *c as usize);
            let made = decision(trial, z, *b);
            made.is_some() && made == expected
        })
        .count();

    Some(correct as f64 / trials.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_covers_every_epoch() {
        let timeline = Timeline::new(&[("fixation", 100.), ("stimulus", 60.), ("decision", 40.)], 20.);

        assert_eq!(timeline.steps(), 10);
        assert_eq!(timeline.indices("fixation"), vec![0, 1, 2, 3, 4]);
        assert_eq!(timeline.indices("stimulus"), vec![5, 6, 7]);
        assert_eq!(timeline.indices("decision"), vec![8, 9]);
        assert!(timeline.indices("delay").is_empty());
    }

    #[test]
    fn choice_targets_score_fixation_and_decision() {
        let timeline = Timeline::new(&[("fixation", 40.), ("stimulus", 40.), ("decision", 40.)], 20.);
        let (outputs, mask) = timeline.choice_targets(2, 1);

        assert_eq!(mask.column(0).to_vec(), vec![1., 1., 0., 0., 1., 1.]);
        assert_eq!(outputs.row(0).to_vec(), vec![TARGET_LO, TARGET_LO]);
        assert_eq!(outputs.row(5).to_vec(), vec![TARGET_LO, TARGET_HI]);
    }

    #[test]
    fn performance_reads_decision_window() {
        let timeline = Timeline::new(&[("fixation", 20.), ("decision", 40.)], 20.);
        let mut trial = Trial {
            t: timeline.t.clone(),
            epochs: timeline.epochs.clone(),
            ..Default::default()
        };
        trial.info.insert("choice".into(), 1.);

        let mut z = Array3::zeros((3, 2, 2));
        // trial 0 picks output 1 during the decision, trial 1 output 0
        z[[1, 0, 1]] = 1.;
        z[[2, 0, 1]] = 1.;
        z[[0, 1, 1]] = 5.;
        z[[1, 1, 0]] = 1.;

        let trials = vec![trial.clone(), trial];
        assert_eq!(choice_performance(&trials, &z), Some(0.5));
    }

    #[test]
    fn ei_labels_split() {
        let ei = ei_labels(10, 0.8);
        assert_eq!(ei.iter().filter(|v| **v > 0.).count(), 8);
        assert_eq!(ei[9], -1.);
    }
}
