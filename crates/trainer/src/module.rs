//! Per-batch and per-epoch schedule control for the tagger.
//!
//! `TaggingModule` owns the learning-rate schedule and the range-test history.
//! It never touches tensors: the trainer reports losses and batch/epoch
//! boundaries, and the module drives the optimizer's rates through
//! [`ParamGroups`].

use std::path::PathBuf;

use log::{debug, info};

use crate::config::{HParams, OptimizerKind, SchedulerKind};
use crate::error::{Result, TrainError};
use crate::lr_finder::{plot_lr, BatchExponentialLr, LrHistory};
use crate::optim::ParamGroups;
use crate::scheduler::{
    CyclicLr, ExponentialLr, ReduceLrOnPlateau, CYCLIC_STEP_SIZE_UP, PLATEAU_MIN_LR,
    PLATEAU_PATIENCE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configuring,
    TestLrRunning,
    /// Terminal: the range test has been plotted.
    TestLrDone,
    TrainingCyclic,
    TrainingExpDecay,
    TrainingPlateau,
}

#[derive(Debug, Clone)]
pub enum Schedule {
    LrTest(BatchExponentialLr),
    Cyclic(CyclicLr),
    Exponential(ExponentialLr),
    Plateau(ReduceLrOnPlateau),
}

impl Schedule {
    pub fn configure<O: ParamGroups + ?Sized>(hparams: &HParams, optimizer: &mut O) -> Result<Self> {
        if hparams.test_lr {
            let stepper =
                BatchExponentialLr::new(optimizer, hparams.lr_test_max_lr, hparams.lr_test_steps)?;
            return Ok(Self::LrTest(stepper));
        }

        let schedule = match hparams.scheduler {
            SchedulerKind::Cyclic => Self::Cyclic(CyclicLr::new(
                optimizer,
                hparams.min_lr,
                hparams.learning_rate,
                CYCLIC_STEP_SIZE_UP,
                hparams.optimizer == OptimizerKind::Sgd,
            )),
            SchedulerKind::Exponential => Self::Exponential(ExponentialLr::new(hparams.decay_factor)),
            SchedulerKind::Plateau => Self::Plateau(ReduceLrOnPlateau::new(
                hparams.decay_factor,
                PLATEAU_PATIENCE,
                PLATEAU_MIN_LR,
            )),
        };
        Ok(schedule)
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::LrTest(_) => Phase::TestLrRunning,
            Self::Cyclic(_) => Phase::TrainingCyclic,
            Self::Exponential(_) => Phase::TrainingExpDecay,
            Self::Plateau(_) => Phase::TrainingPlateau,
        }
    }
}

/// Result of a batch-end event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// The range test collected its last step and wrote `plot`.
    TestComplete { plot: PathBuf },
}

pub struct TaggingModule {
    phase: Phase,
    schedule: Option<Schedule>,
    history: LrHistory,
    plot_path: PathBuf,
    /// Training steps seen since the run started.
    steps: usize,
}

impl TaggingModule {
    pub fn new(plot_path: impl Into<PathBuf>) -> Self {
        Self {
            phase: Phase::Configuring,
            schedule: None,
            history: LrHistory::default(),
            plot_path: plot_path.into(),
            steps: 0,
        }
    }

    pub fn configure_optimizers<O: ParamGroups + ?Sized>(
        &mut self,
        hparams: &HParams,
        optimizer: &mut O,
    ) -> Result<Phase> {
        hparams.validate()?;
        let schedule = Schedule::configure(hparams, optimizer)?;
        // the history is bounded by the same budget as the stepper
        self.history = LrHistory::with_capacity(hparams.lr_test_steps);
        self.phase = schedule.phase();
        self.schedule = Some(schedule);

        match self.phase {
            Phase::TestLrRunning => info!(
                "LR range test: {} steps from {:.2e} to {:.2e}",
                hparams.lr_test_steps, hparams.learning_rate, hparams.lr_test_max_lr
            ),
            phase => info!("Optimizer {} with schedule {:?}", hparams.optimizer, phase),
        }
        Ok(self.phase)
    }

    fn ensure_active(&self) -> Result<()> {
        match self.phase {
            Phase::Configuring => Err(TrainError::NotConfigured),
            Phase::TestLrDone => Err(TrainError::LrTestFinished),
            _ => Ok(()),
        }
    }

    /// Called with the loss of every training batch, before the optimizer
    /// update. In range-test mode this records the rate about to be applied
    /// together with the smoothed loss.
    pub fn on_train_step(&mut self, loss: f64) -> Result<()> {
        self.ensure_active()?;
        if let Some(Schedule::LrTest(stepper)) = &self.schedule {
            self.history.record(stepper.current_lr(), loss, self.steps)?;
        }
        self.steps += 1;
        Ok(())
    }

    /// Called once after every training batch.
    pub fn on_batch_end<O: ParamGroups + ?Sized>(&mut self, optimizer: &mut O) -> Result<StepOutcome> {
        self.ensure_active()?;
        match &mut self.schedule {
            Some(Schedule::LrTest(stepper)) => {
                stepper.step(optimizer)?;
                if self.history.is_full() {
                    plot_lr(&self.history, &self.plot_path)?;
                    info!("Saved LR-loss plot to {}", self.plot_path.display());
                    self.phase = Phase::TestLrDone;
                    return Ok(StepOutcome::TestComplete {
                        plot: self.plot_path.clone(),
                    });
                }
            }
            Some(Schedule::Cyclic(scheduler)) => scheduler.step(optimizer),
            Some(Schedule::Exponential(_)) | Some(Schedule::Plateau(_)) => {}
            None => return Err(TrainError::NotConfigured),
        }
        Ok(StepOutcome::Continue)
    }

    /// Called once per epoch after validation.
    pub fn on_epoch_end<O: ParamGroups + ?Sized>(&mut self, optimizer: &mut O, val_loss: f64) -> Result<()> {
        self.ensure_active()?;
        match &mut self.schedule {
            Some(Schedule::Exponential(scheduler)) => {
                scheduler.step(optimizer);
                debug!("Exponential decay: lr now {:?}", optimizer.learning_rates());
            }
            Some(Schedule::Plateau(scheduler)) => {
                scheduler.step(optimizer, val_loss);
            }
            Some(Schedule::LrTest(_)) | Some(Schedule::Cyclic(_)) => {}
            None => return Err(TrainError::NotConfigured),
        }
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn history(&self) -> &LrHistory {
        &self.history
    }
}
