use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use crate::connectivity::Connectivity;
use crate::error::Result;

/// Hyperparameters for one training run.
///
/// Every field has a default, so a config file only needs the entries that
/// differ. `n_out` is required and left at zero by default; the trainer rejects
/// it until it is set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub n_in: usize,
    pub n: usize,
    pub n_out: usize,

    pub rectify_inputs: bool,
    pub train_brec: bool,
    pub brec: f64,
    pub train_bout: bool,
    pub bout: f64,
    pub train_x0: bool,
    pub x0: f64,

    pub mode: String,
    pub tau: f64,
    pub dt: Option<f64>,

    pub c_in: Option<Connectivity>,
    pub c_rec: Option<Connectivity>,
    pub c_out: Option<Connectivity>,
    pub ei: Option<Vec<f64>>,
    pub ei_positive_func: String,

    pub hidden_activation: String,
    pub output_activation: String,

    pub n_gradient: usize,
    pub n_validation: usize,
    pub batch_size: usize,

    pub lambda_omega: f64,
    pub lambda1_in: f64,
    pub lambda1_rec: f64,
    pub lambda1_out: f64,
    pub lambda2_in: f64,
    pub lambda2_rec: f64,
    pub lambda2_out: f64,
    pub lambda2_r: f64,

    pub min_error: f64,
    pub learning_rate: f64,
    pub max_gradient_norm: f64,
    pub bound: f64,

    pub baseline_in: f64,
    pub var_in: f64,
    pub var_rec: f64,

    pub seed: u64,
    pub gradient_seed: u64,
    pub validation_seed: u64,
    pub rho0: f64,
    pub max_iter: usize,

    pub distribution_in: Option<String>,
    pub distribution_rec: Option<String>,
    pub distribution_out: Option<String>,

    pub checkfreq: Option<usize>,
    pub patience: Option<usize>,
}

impl Config {
    pub fn load(path: &str) -> Result<Config> {
        let path = PathBuf::from(path);

        let config_bytes = fs::read(path)?;
        let config = serde_json::from_slice(&config_bytes)?;

        Ok(config)
    }

    pub fn new() -> Config {
        Config {
            n_in: 0,
            n: 100,
            n_out: 0,

            rectify_inputs: true,
            train_brec: false,
            brec: 0.,
            train_bout: false,
            bout: 0.,
            train_x0: true,
            x0: 0.1,

            mode: "batch".into(),
            tau: 100.,
            dt: None,

            c_in: None,
            c_rec: None,
            c_out: None,
            ei: None,
            ei_positive_func: "rectify".into(),

            hidden_activation: "rectify".into(),
            output_activation: "linear".into(),

            n_gradient: 20,
            n_validation: 1000,
            batch_size: 1000,

            lambda_omega: 2.,
            lambda1_in: 0.,
            lambda1_rec: 0.,
            lambda1_out: 0.,
            lambda2_in: 0.,
            lambda2_rec: 0.,
            lambda2_out: 0.,
            lambda2_r: 0.,

            min_error: 0.,
            learning_rate: 1e-2,
            max_gradient_norm: 1.,
            bound: 1e-20,

            baseline_in: 0.2,
            var_in: 0.01_f64.powi(2),
            var_rec: 0.01_f64.powi(2),

            seed: 1234,
            gradient_seed: 11,
            validation_seed: 22,
            rho0: 1.5,
            max_iter: 10_000_000,

            distribution_in: None,
            distribution_rec: None,
            distribution_out: None,

            checkfreq: None,
            patience: None,
        }
    }

    pub fn dump(&self, path: &str) -> Result<()> {
        let path = PathBuf::from(path);
        let config_str = serde_json::to_string_pretty(&self)?;
        fs::write(path, config_str)?;

        Ok(())
    }

    /// Integration step `dt / tau`, with `dt` defaulting to `tau / 5`.
    pub fn alpha(&self) -> f64 {
        self.dt.unwrap_or(self.tau / 5.) / self.tau
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}
