use std::path::Path;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, OptimizerState, FORMAT_VERSION};
use crate::config::Config;
use crate::dataset::{Dataset, Task};
use crate::error::{Result, TrainError};
use crate::network::{Costs, Model, Weights};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdOptions {
    pub learning_rate: f64,
    pub max_gradient_norm: f64,
    pub min_error: f64,
    pub max_iter: usize,
    pub checkfreq: usize,
    pub patience: Option<usize>,
    pub batch_size: usize,
    pub continuous: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    MinError,
    Terminated,
    Patience,
    MaxIter,
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct Report {
    pub stop: Stop,
    pub checkpoint: Checkpoint,
}

/// Plain stochastic gradient descent with global norm clipping, periodic
/// validation and checkpointing.
pub struct Sgd<'a> {
    pub model: &'a Model,
    pub task: &'a dyn Task,
    pub options: SgdOptions,
    pub config: &'a Config,
    pub settings: &'a [(String, String)],
}

struct Validation {
    costs: Costs,
    performance: Option<f64>,
}

impl<'a> Sgd<'a> {
    fn validate(&self, w: &Weights, data: &mut Dataset) -> Result<Validation> {
        let chunks = data.next_chunked(self.options.batch_size)?;

        let (mut loss, mut sq, mut norm) = (0., 0., 0.);
        let (mut perf, mut perf_trials) = (0., 0usize);
        let mut has_performance = true;

        for chunk in chunks.iter() {
            let (costs, traj) = self.model.evaluate(w, chunk, None);
            let m = chunk.mask.sum();

            loss += costs.loss * m;
            sq += costs.error.powi(2) * m;
            norm += m;

            match self.task.performance(&chunk.trials, &traj.z) {
                Some(p) => {
                    perf += p * chunk.size() as f64;
                    perf_trials += chunk.size();
                }
                None => has_performance = false,
            }
        }

        let norm = norm.max(f64::MIN_POSITIVE);
        let costs = Costs {
            loss: loss / norm,
            error: (sq / norm).sqrt(),
        };

        Ok(Validation {
            costs,
            performance: (has_performance && perf_trials > 0).then(|| perf / perf_trials as f64),
        })
    }

    fn checkpoint(&self, current: &Weights, best: &Weights, state: &OptimizerState) -> Checkpoint {
        Checkpoint {
            version: FORMAT_VERSION,
            config: self.config.clone(),
            settings: self.settings.to_vec(),
            current: current.clone(),
            best: best.clone(),
            best_effective: self.model.effective(best),
            state: state.clone(),
        }
    }

    /// Runs until a stopping condition is met, saving to `savefile` at every
    /// validation. With `resume`, training continues from that checkpoint's
    /// current weights and optimizer state.
    pub fn train(
        &self,
        init: Weights,
        gradient_data: &mut Dataset,
        validation_data: &mut Dataset,
        savefile: &Path,
        resume: Option<Checkpoint>,
    ) -> Result<Report> {
        let options = self.options;
        let trainables = self.model.trainables;
        let checkfreq = options.checkfreq.max(1);

        let (mut w, mut best, mut state) = match resume {
            Some(checkpoint) => {
                info!(
                    iteration = checkpoint.state.iteration,
                    best_error = checkpoint.state.best_error,
                    "recovering from checkpoint"
                );
                (checkpoint.current, checkpoint.best, checkpoint.state)
            }
            None => (init.clone(), init, OptimizerState::new()),
        };
        gradient_data.set_calls(state.gradient_calls);

        let mut last_omega = None;

        loop {
            let iteration = state.iteration;

            if iteration % checkfreq == 0 || iteration >= options.max_iter {
                let validation = self.validate(&w, validation_data)?;
                let costs = validation.costs;

                if !costs.loss.is_finite() {
                    return Err(TrainError::Diverged {
                        iteration,
                        what: "validation loss",
                    });
                }

                // a recovered run has already recorded this iteration
                let recorded = state.costs_history.last().map(|(i, _)| *i) == Some(iteration);
                if !recorded {
                    state.costs_history.push((iteration, costs));
                    if let Some(omega) = last_omega {
                        state.omega_history.push((iteration, omega));
                    }
                    if let Some(performance) = validation.performance {
                        state.performance_history.push(performance);
                    }

                    if costs.error < state.best_error {
                        state.best_error = costs.error;
                        state.best_iteration = iteration;
                        best = w.clone();
                    }
                }

                info!(
                    iteration,
                    loss = costs.loss,
                    error = costs.error,
                    best_error = state.best_error,
                    omega = last_omega.unwrap_or(0.),
                    performance = validation.performance.unwrap_or(f64::NAN),
                    "validation"
                );

                let stop = if costs.error <= options.min_error {
                    Some(Stop::MinError)
                } else if validation.performance.is_some()
                    && self.task.terminate(&state.performance_history)
                {
                    Some(Stop::Terminated)
                } else if options
                    .patience
                    .is_some_and(|p| iteration - state.best_iteration >= p)
                {
                    Some(Stop::Patience)
                } else if iteration >= options.max_iter {
                    Some(Stop::MaxIter)
                } else {
                    None
                };

                let checkpoint = self.checkpoint(&w, &best, &state);
                checkpoint.save(savefile)?;

                if let Some(stop) = stop {
                    info!(iteration, ?stop, best_error = state.best_error, "training finished");
                    return Ok(Report { stop, checkpoint });
                }
            }

            let batch = gradient_data.next_minibatch()?;
            let x_init = match options.continuous {
                true => state.continuous_state.as_ref().map(|x| x.view()),
                false => None,
            };
            let mut step = self.model.gradient(&w, &batch, x_init);

            let objective = step.costs.loss + step.regs + step.omega;
            if !objective.is_finite() {
                return Err(TrainError::Diverged {
                    iteration,
                    what: "loss",
                });
            }
            if !step.grad.is_finite() {
                return Err(TrainError::Diverged {
                    iteration,
                    what: "gradient",
                });
            }

            let norm = step.grad.norm_sq(&trainables).sqrt();
            if norm > options.max_gradient_norm {
                step.grad.scale(options.max_gradient_norm / norm);
            }

            w.scaled_add(-options.learning_rate, &step.grad, &trainables);

            debug!(
                iteration,
                loss = step.costs.loss,
                regs = step.regs,
                omega = step.omega,
                grad_norm = norm,
                "gradient step"
            );

            if options.continuous {
                if batch.size() != 1 {
                    warn!(trials = batch.size(), "continuous mode expects single-trial minibatches");
                }
                state.continuous_state = Some(step.final_state);
            }

            last_omega = Some(step.omega);
            state.iteration += 1;
            state.gradient_calls = gradient_data.calls();
        }
    }
}
