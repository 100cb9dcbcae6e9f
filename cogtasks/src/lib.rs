pub mod multisensory;
pub mod romo;
pub mod tools;

use cogrnn::dataset::Task;
use cogrnn::Config;

pub use multisensory::Multisensory;
pub use romo::Romo;

/// A task together with the network it is trained on.
pub trait Experiment {
    fn name(&self) -> &'static str;

    /// Default hyperparameters for this task.
    fn config(&self) -> Config;

    fn task(&self) -> &dyn Task;
}

pub const EXPERIMENTS: [&str; 2] = ["romo", "multisensory"];

pub fn experiment(name: &str) -> Option<Box<dyn Experiment>> {
    match name {
        "romo" => Some(Box::new(Romo::default())),
        "multisensory" => Some(Box::new(Multisensory::default())),
        _ => None,
    }
}
