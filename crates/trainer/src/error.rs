use thiserror::Error;

/// Invalid or unsupported run configuration. Raised before any training
/// happens.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unknown optimizer `{0}` (expected one of: adam, sgd)")]
    UnknownOptimizer(String),

    #[error("Unknown scheduler `{0}` (expected one of: cyclic, exp, plateau)")]
    UnknownScheduler(String),

    #[error("The LR range test cannot run in distributed mode")]
    LrTestDistributed,

    #[error("`{name}` must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },

    #[error("`{name}` is too large: {value}")]
    TooLarge { name: &'static str, value: usize },

    #[error("Optimizer exposes no parameter groups")]
    NoParamGroups,

    #[error("Invalid value `{value}` for environment variable {name}")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LR stepper advanced past its budget of {budget} steps")]
    BudgetOverrun { budget: usize },

    #[error("Cannot smooth the loss at step {step}: no previous value recorded")]
    MissingSmoothingBase { step: usize },

    #[error("The LR range test has already completed")]
    LrTestFinished,

    #[error("Training module used before its optimizers were configured")]
    NotConfigured,

    #[error("Plot error: {0}")]
    Plot(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;
