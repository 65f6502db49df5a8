//! Production learning-rate schedules.
//!
//! - `CyclicLr` - triangular cycle between two rates, stepped every batch
//! - `ExponentialLr` - multiplicative decay, stepped every epoch
//! - `ReduceLrOnPlateau` - decay when validation loss stalls, stepped every epoch

use log::info;

use crate::optim::ParamGroups;

pub const CYCLIC_STEP_SIZE_UP: usize = 480;
pub const CYCLIC_BASE_MOMENTUM: f64 = 0.8;
pub const CYCLIC_MAX_MOMENTUM: f64 = 0.9;

pub const PLATEAU_PATIENCE: usize = 3;
pub const PLATEAU_MIN_LR: f64 = 1e-6;
pub const PLATEAU_THRESHOLD: f64 = 1e-4;

/// Triangular cyclic learning rate.
///
/// The rate climbs linearly from `base_lr` to `max_lr` over `step_size_up`
/// batches and falls back over the same number. When momentum cycling is on,
/// momentum moves the opposite way between 0.8 and 0.9.
#[derive(Debug, Clone)]
pub struct CyclicLr {
    base_lr: f64,
    max_lr: f64,
    step_size_up: usize,
    step_size_down: usize,
    cycle_momentum: bool,
    step: usize,
}

impl CyclicLr {
    /// Resets every group to `base_lr` (and to the max momentum when cycling).
    pub fn new<O: ParamGroups + ?Sized>(
        optimizer: &mut O,
        base_lr: f64,
        max_lr: f64,
        step_size_up: usize,
        cycle_momentum: bool,
    ) -> Self {
        let scheduler = Self {
            base_lr,
            max_lr,
            step_size_up: step_size_up.max(1),
            step_size_down: step_size_up.max(1),
            cycle_momentum,
            step: 0,
        };
        scheduler.apply(optimizer);
        scheduler
    }

    /// Position in the current cycle, 0 at `base_lr` and 1 at `max_lr`.
    fn scale(&self) -> f64 {
        let total = self.step_size_up + self.step_size_down;
        let pos = self.step % total;
        if pos <= self.step_size_up {
            pos as f64 / self.step_size_up as f64
        } else {
            (total - pos) as f64 / self.step_size_down as f64
        }
    }

    pub fn get_lr(&self) -> f64 {
        self.base_lr + (self.max_lr - self.base_lr) * self.scale()
    }

    pub fn get_momentum(&self) -> f64 {
        CYCLIC_MAX_MOMENTUM - (CYCLIC_MAX_MOMENTUM - CYCLIC_BASE_MOMENTUM) * self.scale()
    }

    fn apply<O: ParamGroups + ?Sized>(&self, optimizer: &mut O) {
        let lr = self.get_lr();
        let momentum = self.get_momentum();
        for group in 0..optimizer.learning_rates().len() {
            optimizer.set_learning_rate(group, lr);
            if self.cycle_momentum {
                optimizer.set_momentum(group, momentum);
            }
        }
    }

    pub fn step<O: ParamGroups + ?Sized>(&mut self, optimizer: &mut O) {
        self.step += 1;
        self.apply(optimizer);
    }
}

/// `lr = lr * gamma` once per epoch.
#[derive(Debug, Clone)]
pub struct ExponentialLr {
    gamma: f64,
    epoch: usize,
}

impl ExponentialLr {
    pub fn new(gamma: f64) -> Self {
        Self { gamma, epoch: 0 }
    }

    pub fn step<O: ParamGroups + ?Sized>(&mut self, optimizer: &mut O) {
        self.epoch += 1;
        for (group, lr) in optimizer.learning_rates().into_iter().enumerate() {
            optimizer.set_learning_rate(group, lr * self.gamma);
        }
    }
}

/// Lowers the learning rate when the monitored loss has not improved for more
/// than `patience` epochs.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    /// Relative improvement required over the best value.
    threshold: f64,
    /// Reductions smaller than this are skipped.
    eps: f64,
    best: f64,
    num_bad_epochs: usize,
    epoch: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            threshold: PLATEAU_THRESHOLD,
            eps: 1e-8,
            best: f64::INFINITY,
            num_bad_epochs: 0,
            epoch: 0,
        }
    }

    fn is_better(&self, metric: f64) -> bool {
        metric < self.best * (1.0 - self.threshold)
    }

    /// Feeds one epoch's validation loss. Returns whether any rate was reduced.
    pub fn step<O: ParamGroups + ?Sized>(&mut self, optimizer: &mut O, metric: f64) -> bool {
        self.epoch += 1;
        if self.is_better(metric) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs <= self.patience {
            return false;
        }
        self.num_bad_epochs = 0;

        let mut reduced = false;
        for (group, old_lr) in optimizer.learning_rates().into_iter().enumerate() {
            let new_lr = (old_lr * self.factor).max(self.min_lr);
            if old_lr - new_lr > self.eps {
                optimizer.set_learning_rate(group, new_lr);
                info!(
                    "Epoch {}: reducing learning rate of group {} to {:.4e}.",
                    self.epoch, group, new_lr
                );
                reduced = true;
            }
        }
        reduced
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}
