use std::io;

pub type Result<T> = std::result::Result<T, TrainError>;

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("unknown distribution: {0}")]
    UnknownDistribution(String),

    #[error("unknown ei_positive_func: {0}")]
    UnknownEiPositiveFunc(String),

    #[error("unknown hidden activation: {0}")]
    UnknownHiddenActivation(String),

    #[error("unknown output activation: {0}")]
    UnknownOutputActivation(String),

    #[error("unknown mode: {0}")]
    UnknownMode(String),

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    Shape {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("task produced an invalid trial: {0}")]
    Task(String),

    #[error("training diverged at iteration {iteration}: {what} is not finite")]
    Diverged { iteration: usize, what: &'static str },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Encode(#[from] bincode::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TrainError {
    pub fn shape(what: &'static str, expected: &[usize], actual: &[usize]) -> TrainError {
        TrainError::Shape {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
