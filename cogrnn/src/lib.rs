pub mod activation;
pub mod checkpoint;
pub mod config;
pub mod connectivity;
pub mod constraints;
pub mod dataset;
pub mod error;
pub mod linalg;
pub mod logging;
pub mod network;
pub mod rnn;
pub mod sgd;
pub mod trainer;

pub use checkpoint::Checkpoint;
pub use config::Config;
pub use connectivity::Connectivity;
pub use dataset::{Dataset, Task, Trial, TrialParams};
pub use error::{Result, TrainError};
pub use rnn::{Rnn, Run};
pub use sgd::{Report, Stop};
pub use trainer::Trainer;
