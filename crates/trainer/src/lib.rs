pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod lr_finder;
pub mod metrics;
pub mod module;
pub mod optim;
pub mod scheduler;
pub mod train;

pub use config::{HParams, OptimizerKind, SchedulerKind};
pub use error::{ConfigError, TrainError};
pub use module::{Phase, StepOutcome, TaggingModule};
pub use train::{RunOutcome, Trainer};
