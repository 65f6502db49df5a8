use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use audioset_core::TaggerConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::lr_finder::{LR_TEST_MAX_LR, LR_TEST_STEPS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::Adam),
            "sgd" => Ok(Self::Sgd),
            _ => Err(ConfigError::UnknownOptimizer(s.to_string())),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adam => f.write_str("adam"),
            Self::Sgd => f.write_str("sgd"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Triangular cyclic LR, stepped every batch.
    Cyclic,
    /// Multiplicative decay, stepped every epoch.
    #[serde(rename = "exp", alias = "exponential")]
    Exponential,
    /// Reduce on validation-loss plateau, stepped every epoch.
    Plateau,
}

impl FromStr for SchedulerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cyclic" => Ok(Self::Cyclic),
            "exp" | "exponential" => Ok(Self::Exponential),
            "plateau" => Ok(Self::Plateau),
            _ => Err(ConfigError::UnknownScheduler(s.to_string())),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cyclic => f.write_str("cyclic"),
            Self::Exponential => f.write_str("exp"),
            Self::Plateau => f.write_str("plateau"),
        }
    }
}

/// Hyperparameters of one training run. Parsed once from the command line and
/// never mutated afterwards.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about = "Train a GRU audio tagger on AudioSet features", long_about = None)]
pub struct HParams {
    /// Peak learning rate (also the starting rate of the LR range test)
    #[arg(long, default_value_t = 0.3)]
    pub learning_rate: f64,

    /// Lower bound of the cyclic schedule
    #[arg(long, default_value_t = 1e-3)]
    pub min_lr: f64,

    /// Decay factor for the exponential and plateau schedules
    #[arg(long, default_value_t = 0.5)]
    pub decay_factor: f64,

    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    /// adam | sgd
    #[arg(long, default_value_t = OptimizerKind::Adam)]
    pub optimizer: OptimizerKind,

    /// cyclic | exp | plateau
    #[arg(long, default_value_t = SchedulerKind::Plateau)]
    pub scheduler: SchedulerKind,

    /// Run the LR range test instead of training
    #[arg(long)]
    pub test_lr: bool,

    /// Final learning rate of the LR range test sweep
    #[arg(long, default_value_t = LR_TEST_MAX_LR)]
    pub lr_test_max_lr: f64,

    /// Number of batches in the LR range test sweep
    #[arg(long, default_value_t = LR_TEST_STEPS)]
    pub lr_test_steps: usize,

    #[arg(long, default_value_t = 2)]
    pub num_fc_layers: i64,

    #[arg(long, default_value_t = 256)]
    pub num_hidden: i64,

    /// Number of feature frames per training window
    #[arg(long, default_value_t = 32)]
    pub window: i64,

    /// Shard the data across processes using RANK / WORLD_SIZE
    #[arg(long)]
    pub distributed: bool,

    /// Directory holding train.safetensors and val.safetensors
    #[arg(long, default_value = "data/audioset")]
    pub dataset_path: PathBuf,

    #[arg(long, default_value = "./audioset")]
    pub checkpoint_path: PathBuf,

    /// Number of intra-op threads used by libtorch
    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    #[arg(long, default_value_t = 80)]
    pub max_nb_epochs: usize,

    /// Log training progress every N batches
    #[arg(long, default_value_t = 10)]
    pub log_interval: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl HParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("learning_rate", self.learning_rate),
            ("min_lr", self.min_lr),
            ("decay_factor", self.decay_factor),
            ("lr_test_max_lr", self.lr_test_max_lr),
            ("batch_size", self.batch_size as f64),
            ("lr_test_steps", self.lr_test_steps as f64),
            ("num_fc_layers", self.num_fc_layers as f64),
            ("num_hidden", self.num_hidden as f64),
            ("window", self.window as f64),
            ("log_interval", self.log_interval as f64),
            ("workers", self.workers as f64),
        ];
        for (name, value) in positive {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::NonPositive { name, value });
            }
        }

        self.num_threads()?;

        if self.test_lr && self.distributed {
            return Err(ConfigError::LrTestDistributed);
        }
        Ok(())
    }

    /// `workers` as the thread count libtorch expects.
    pub fn num_threads(&self) -> Result<i32, ConfigError> {
        i32::try_from(self.workers).map_err(|_| ConfigError::TooLarge {
            name: "workers",
            value: self.workers,
        })
    }

    pub fn tagger_config(&self) -> TaggerConfig {
        TaggerConfig {
            num_hidden: self.num_hidden,
            num_fc_layers: self.num_fc_layers,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> HParams {
        let mut argv = vec!["audioset-train"];
        argv.extend_from_slice(args);
        HParams::parse_from(argv)
    }

    #[test]
    fn defaults_match_reference_run() {
        let hp = parse(&[]);
        assert_eq!(hp.learning_rate, 0.3);
        assert_eq!(hp.min_lr, 1e-3);
        assert_eq!(hp.batch_size, 128);
        assert_eq!(hp.optimizer, OptimizerKind::Adam);
        assert_eq!(hp.scheduler, SchedulerKind::Plateau);
        assert_eq!(hp.lr_test_steps, 600);
        assert_eq!(hp.max_nb_epochs, 80);
        assert!(!hp.test_lr);
        assert!(hp.validate().is_ok());
    }

    #[test]
    fn every_option_is_overridable() {
        let hp = parse(&[
            "--optimizer",
            "sgd",
            "--scheduler",
            "exp",
            "--window",
            "64",
            "--checkpoint-path",
            "/tmp/run",
            "--test-lr",
        ]);
        assert_eq!(hp.optimizer, OptimizerKind::Sgd);
        assert_eq!(hp.scheduler, SchedulerKind::Exponential);
        assert_eq!(hp.window, 64);
        assert_eq!(hp.checkpoint_path, PathBuf::from("/tmp/run"));
        assert!(hp.test_lr);
    }

    #[test]
    fn unknown_scheduler_is_a_config_error() {
        assert_eq!(
            "unknown".parse::<SchedulerKind>(),
            Err(ConfigError::UnknownScheduler("unknown".to_string()))
        );
        let parsed = HParams::try_parse_from(["audioset-train", "--scheduler", "unknown"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn unknown_optimizer_is_a_config_error() {
        assert_eq!(
            "rmsprop".parse::<OptimizerKind>(),
            Err(ConfigError::UnknownOptimizer("rmsprop".to_string()))
        );
    }

    #[test]
    fn scheduler_accepts_both_spellings_of_exponential() {
        assert_eq!("exp".parse::<SchedulerKind>(), Ok(SchedulerKind::Exponential));
        assert_eq!("exponential".parse::<SchedulerKind>(), Ok(SchedulerKind::Exponential));
    }

    #[test]
    fn lr_test_with_distributed_is_rejected() {
        let hp = parse(&["--test-lr", "--distributed"]);
        assert_eq!(hp.validate(), Err(ConfigError::LrTestDistributed));
    }

    #[test]
    fn non_positive_values_are_rejected() {
        let hp = parse(&["--batch-size", "0"]);
        assert!(matches!(
            hp.validate(),
            Err(ConfigError::NonPositive { name: "batch_size", .. })
        ));

        let hp = parse(&["--workers", "0"]);
        assert!(matches!(
            hp.validate(),
            Err(ConfigError::NonPositive { name: "workers", .. })
        ));
    }

    #[test]
    fn thread_count_must_fit_in_i32() {
        assert_eq!(parse(&["--workers", "4"]).num_threads(), Ok(4));

        let too_many = (i32::MAX as u64 + 1).to_string();
        let hp = parse(&["--workers", &too_many]);
        assert!(matches!(
            hp.num_threads(),
            Err(ConfigError::TooLarge { name: "workers", .. })
        ));
    }

    #[test]
    fn hparams_round_trip_through_yaml() {
        let hp = parse(&["--scheduler", "cyclic"]);
        let yaml = serde_yaml::to_string(&hp).unwrap();
        assert!(yaml.contains("scheduler: cyclic"));
        let back: HParams = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.scheduler, SchedulerKind::Cyclic);
    }
}
