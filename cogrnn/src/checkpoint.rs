use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::config::Config;
use crate::error::{Result, TrainError};
use crate::network::{Costs, Weights};

pub const FORMAT_VERSION: u32 = 1;

/// Optimizer progress needed to resume an interrupted run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub iteration: usize,
    pub costs_history: Vec<(usize, Costs)>,
    pub omega_history: Vec<(usize, f64)>,
    pub performance_history: Vec<f64>,
    pub best_iteration: usize,
    pub best_error: f64,
    pub gradient_calls: u64,
    pub continuous_state: Option<Array2<f64>>,
}

impl OptimizerState {
    pub fn new() -> OptimizerState {
        OptimizerState {
            iteration: 0,
            costs_history: vec![],
            omega_history: vec![],
            performance_history: vec![],
            best_iteration: 0,
            best_error: f64::INFINITY,
            gradient_calls: 0,
            continuous_state: None,
        }
    }
}

impl Default for OptimizerState {
    fn default() -> OptimizerState {
        OptimizerState::new()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub version: u32,
    /// Parameters as resolved by the trainer, including rescaled masks.
    pub config: Config,
    pub settings: Vec<(String, String)>,
    pub current: Weights,
    pub best: Weights,
    /// Effective weights of `best`, ready for inference.
    pub best_effective: Weights,
    pub state: OptimizerState,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_then_rename(bytes: &[u8], tmp: &Path, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp, path)
}

impl Checkpoint {
    /// Writes to a sibling temp file and renames it over `path`, so a crash
    /// mid-write never leaves a truncated checkpoint behind.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = temp_path(path);

        let bytes = bincode::serialize(self)?;
        if let Err(e) = write_then_rename(&bytes, &tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        debug!(
            path = %path.display(),
            bytes = bytes.len(),
            iteration = self.state.iteration,
            "checkpoint saved"
        );

        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Checkpoint> {
        let bytes = fs::read(path.as_ref())?;
        let checkpoint: Checkpoint = bincode::deserialize(&bytes)?;

        if checkpoint.version != FORMAT_VERSION {
            return Err(TrainError::InvalidParameter {
                name: "checkpoint version",
                reason: format!(
                    "found {}, this build reads {}",
                    checkpoint.version, FORMAT_VERSION
                ),
            });
        }

        Ok(checkpoint)
    }

    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn checkpoint() -> Checkpoint {
        let mut weights = Weights::zeros(1, 2, 1);
        weights.wrec = array![[0.1, -0.2], [0.3, 0.4]];
        weights.x0.fill(0.1);

        let mut config = Config::new();
        config.n_in = 1;
        config.n = 2;
        config.n_out = 1;

        let mut state = OptimizerState::new();
        state.iteration = 42;
        state.costs_history.push((40, Costs { loss: 0.5, error: 0.7 }));
        state.continuous_state = Some(array![[1., 2.]]);

        Checkpoint {
            version: FORMAT_VERSION,
            config,
            settings: vec![("mode".into(), "batch".into()), ("N".into(), "2".into())],
            current: weights.clone(),
            best: weights.clone(),
            best_effective: weights,
            state,
        }
    }

    #[test]
    fn save_then_load_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sav");

        let saved = checkpoint();
        saved.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();

        assert_eq!(loaded, saved);
        assert_eq!(loaded.setting("mode"), Some("batch"));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn save_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sav");

        let mut c = checkpoint();
        c.save(&path).unwrap();
        c.state.iteration = 43;
        c.save(&path).unwrap();

        assert_eq!(Checkpoint::load(&path).unwrap().state.iteration, 43);
    }

    #[test]
    fn failed_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sav");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupied"), b"x").unwrap();

        assert!(matches!(checkpoint().save(&path), Err(TrainError::Io(_))));
        assert!(!temp_path(&path).exists());
        assert!(path.join("occupied").exists());
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sav");

        checkpoint().save(&path).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(Checkpoint::load(&path), Err(TrainError::Encode(_))));
    }

    #[test]
    fn missing_file_propagates_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Checkpoint::load(dir.path().join("nope.sav")),
            Err(TrainError::Io(_))
        ));
    }
}
