//! Learning-rate range test.
//!
//! The rate is swept exponentially from the optimizer's starting rate up to
//! `max_lr` over a fixed number of batches while an exponentially smoothed
//! loss is recorded. The resulting curve is written to an SVG and the run
//! ends.

use std::path::Path;

use plotters::prelude::*;

use crate::error::{ConfigError, Result, TrainError};
use crate::optim::ParamGroups;

pub const LR_TEST_MAX_LR: f64 = 0.1;
pub const LR_TEST_STEPS: usize = 600;

/// Multiplies every group's learning rate by a constant factor once per batch,
/// so that after `budget` steps each group reaches `max_lr`.
#[derive(Debug, Clone)]
pub struct BatchExponentialLr {
    base_lrs: Vec<f64>,
    ratios: Vec<f64>,
    steps_taken: usize,
    budget: usize,
}

impl BatchExponentialLr {
    /// Captures the optimizer's current per-group rates as the base rates.
    pub fn new<O: ParamGroups + ?Sized>(optimizer: &O, max_lr: f64, budget: usize) -> Result<Self> {
        if budget == 0 {
            return Err(ConfigError::NonPositive {
                name: "lr_test_steps",
                value: 0.0,
            }
            .into());
        }
        if !(max_lr.is_finite() && max_lr > 0.0) {
            return Err(ConfigError::NonPositive {
                name: "lr_test_max_lr",
                value: max_lr,
            }
            .into());
        }
        let base_lrs = optimizer.learning_rates();
        if base_lrs.is_empty() {
            return Err(ConfigError::NoParamGroups.into());
        }
        if let Some(&bad) = base_lrs.iter().find(|lr| !(lr.is_finite() && **lr > 0.0)) {
            return Err(ConfigError::NonPositive {
                name: "learning_rate",
                value: bad,
            }
            .into());
        }

        let ratios = base_lrs
            .iter()
            .map(|&base| (max_lr / base).powf(1.0 / budget as f64))
            .collect();

        Ok(Self {
            base_lrs,
            ratios,
            steps_taken: 0,
            budget,
        })
    }

    /// Current rate of every group. Does not advance the schedule.
    pub fn get_lr(&self) -> Vec<f64> {
        self.base_lrs
            .iter()
            .zip(&self.ratios)
            .map(|(base, ratio)| base * ratio.powf(self.steps_taken as f64))
            .collect()
    }

    /// Current rate of the first group.
    pub fn current_lr(&self) -> f64 {
        self.base_lrs[0] * self.ratios[0].powf(self.steps_taken as f64)
    }

    pub fn step<O: ParamGroups + ?Sized>(&mut self, optimizer: &mut O) -> Result<()> {
        if self.steps_taken >= self.budget {
            return Err(TrainError::BudgetOverrun {
                budget: self.budget,
            });
        }
        self.steps_taken += 1;

        for (group, lr) in self.get_lr().into_iter().enumerate() {
            optimizer.set_learning_rate(group, lr);
        }
        Ok(())
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }
}

/// Learning rates and smoothed losses of the range test, one pair per batch.
#[derive(Debug, Clone, Default)]
pub struct LrHistory {
    lrs: Vec<f64>,
    losses: Vec<f64>,
    capacity: usize,
}

impl LrHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lrs: Vec::with_capacity(capacity),
            losses: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `lr` and the smoothed loss for training step `step`.
    ///
    /// Step 0 stores the raw loss; every later step stores
    /// `0.05 * loss + 0.95 * previous`.
    pub fn record(&mut self, lr: f64, loss: f64, step: usize) -> Result<()> {
        if self.is_full() {
            return Err(TrainError::LrTestFinished);
        }

        let smoothed = if step == 0 {
            loss
        } else {
            let previous = self
                .losses
                .last()
                .copied()
                .ok_or(TrainError::MissingSmoothingBase { step })?;
            0.05 * loss + 0.95 * previous
        };

        self.lrs.push(lr);
        self.losses.push(smoothed);
        Ok(())
    }

    pub fn lrs(&self) -> &[f64] {
        &self.lrs
    }

    pub fn losses(&self) -> &[f64] {
        &self.losses
    }

    pub fn len(&self) -> usize {
        self.lrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lrs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }
}

fn plot_err(err: impl std::fmt::Display) -> TrainError {
    TrainError::Plot(err.to_string())
}

/// Renders smoothed loss against learning rate (log x axis) as an SVG.
///
/// Points with a non-finite loss, typically the diverged tail of the sweep,
/// are left out.
pub fn plot_lr(history: &LrHistory, path: &Path) -> Result<()> {
    let points: Vec<(f64, f64)> = history
        .lrs()
        .iter()
        .copied()
        .zip(history.losses().iter().copied())
        .filter(|&(lr, loss)| lr > 0.0 && lr.is_finite() && loss.is_finite())
        .collect();
    if points.is_empty() {
        return Err(TrainError::Plot("no finite points to plot".to_string()));
    }

    let (mut x_min, mut x_max) = points
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(x, _)| (lo.min(x), hi.max(x)));
    if x_min == x_max {
        x_min *= 0.5;
        x_max *= 2.0;
    }
    let (y_min, y_max) = points
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(_, y)| (lo.min(y), hi.max(y)));
    let pad = ((y_max - y_min) * 0.05).max(1e-6);

    let root = SVGBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("LR range test", ("sans-serif", 24.0).into_font())
        .margin(12)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d((x_min..x_max).log_scale(), (y_min - pad)..(y_max + pad))
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc("learning rate")
        .y_desc("smoothed loss")
        .x_label_formatter(&|x: &f64| format!("{:.0e}", x))
        .draw()
        .map_err(plot_err)?;

    chart
        .draw_series(LineSeries::new(points, &BLUE))
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::testing::FakeOptimizer;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn stepper_reaches_max_lr_after_budget() {
        let mut opt = FakeOptimizer::new(&[1e-4]);
        let mut stepper = BatchExponentialLr::new(&opt, 0.1, 600).unwrap();

        let mut previous = stepper.get_lr()[0];
        for _ in 0..600 {
            stepper.step(&mut opt).unwrap();
            let lr = stepper.get_lr()[0];
            assert!(lr > previous);
            previous = lr;
        }
        assert_relative_eq!(opt.lrs[0], 0.1, max_relative = 1e-9);
        assert_relative_eq!(stepper.current_lr(), 0.1, max_relative = 1e-9);
    }

    #[test]
    fn stepper_midpoint_is_geometric_mean() {
        let mut opt = FakeOptimizer::new(&[1e-4]);
        let mut stepper = BatchExponentialLr::new(&opt, 0.1, 600).unwrap();
        for _ in 0..300 {
            stepper.step(&mut opt).unwrap();
        }
        assert_relative_eq!(opt.lrs[0], 1e-4 * 1000f64.sqrt(), max_relative = 1e-9);
    }

    #[test]
    fn get_lr_has_no_side_effects() {
        let mut opt = FakeOptimizer::new(&[1e-3, 1e-2]);
        let mut stepper = BatchExponentialLr::new(&opt, 0.1, 10).unwrap();
        stepper.step(&mut opt).unwrap();

        let first = stepper.get_lr();
        let second = stepper.get_lr();
        assert_eq!(first, second);
        assert_eq!(stepper.steps_taken(), 1);
        assert_eq!(opt.lrs, first);
    }

    #[test]
    fn each_group_keeps_its_own_base_rate() {
        let mut opt = FakeOptimizer::new(&[1e-3, 1e-2]);
        let mut stepper = BatchExponentialLr::new(&opt, 1.0, 3).unwrap();
        for _ in 0..3 {
            stepper.step(&mut opt).unwrap();
        }
        assert_relative_eq!(opt.lrs[0], 1.0, max_relative = 1e-9);
        assert_relative_eq!(opt.lrs[1], 1.0, max_relative = 1e-9);
    }

    #[test]
    fn stepping_past_budget_is_an_error() {
        let mut opt = FakeOptimizer::new(&[1e-4]);
        let mut stepper = BatchExponentialLr::new(&opt, 0.1, 2).unwrap();
        stepper.step(&mut opt).unwrap();
        stepper.step(&mut opt).unwrap();
        let lr_before = opt.lrs[0];

        let err = stepper.step(&mut opt).unwrap_err();
        assert!(matches!(err, TrainError::BudgetOverrun { budget: 2 }));
        assert_eq!(stepper.steps_taken(), 2);
        assert_eq!(opt.lrs[0], lr_before);
    }

    #[test]
    fn zero_budget_is_rejected() {
        let opt = FakeOptimizer::new(&[1e-4]);
        assert!(BatchExponentialLr::new(&opt, 0.1, 0).is_err());
    }

    #[test]
    fn degenerate_rates_are_rejected() {
        let opt = FakeOptimizer::new(&[1e-4]);
        for max_lr in [0.0, -0.1, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                BatchExponentialLr::new(&opt, max_lr, 10),
                Err(TrainError::Config(ConfigError::NonPositive { name: "lr_test_max_lr", .. }))
            ));
        }

        let zero_base = FakeOptimizer::new(&[1e-4, 0.0]);
        assert!(matches!(
            BatchExponentialLr::new(&zero_base, 0.1, 10),
            Err(TrainError::Config(ConfigError::NonPositive { name: "learning_rate", .. }))
        ));
    }

    #[test]
    fn smoothed_losses_follow_ema() {
        let mut history = LrHistory::with_capacity(600);
        for (step, loss) in [1.0, 0.5, 0.5].into_iter().enumerate() {
            history.record(1e-3, loss, step).unwrap();
        }
        let expected = [1.0, 0.975, 0.95125];
        for (got, want) in history.losses().iter().zip(expected) {
            assert_relative_eq!(*got, want, max_relative = 1e-12);
        }
    }

    #[test]
    fn smoothing_without_previous_value_is_an_error() {
        let mut history = LrHistory::with_capacity(10);
        let err = history.record(1e-3, 0.7, 1).unwrap_err();
        assert!(matches!(err, TrainError::MissingSmoothingBase { step: 1 }));
        assert!(history.is_empty());
        assert_eq!(history.lrs().len(), history.losses().len());
    }

    #[test]
    fn history_is_bounded_by_capacity() {
        let mut history = LrHistory::with_capacity(2);
        history.record(1e-3, 1.0, 0).unwrap();
        history.record(1e-2, 1.0, 1).unwrap();
        assert!(history.is_full());
        assert!(matches!(
            history.record(1e-1, 1.0, 2),
            Err(TrainError::LrTestFinished)
        ));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn plot_writes_svg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lr_finder.svg");

        let mut history = LrHistory::with_capacity(50);
        for step in 0..50 {
            let lr = 1e-4 * 1.15f64.powi(step as i32);
            let loss = if step < 45 { 1.0 / (step as f64 + 1.0) } else { f64::INFINITY };
            history.record(lr, loss, step).unwrap();
        }

        plot_lr(&history, &path).unwrap();
        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn plot_rejects_history_without_finite_points() {
        let dir = tempfile::tempdir().unwrap();
        let mut history = LrHistory::with_capacity(1);
        history.record(1e-3, f64::NAN, 0).unwrap();
        assert!(matches!(
            plot_lr(&history, &dir.path().join("x.svg")),
            Err(TrainError::Plot(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_history_columns_stay_aligned(
            losses in proptest::collection::vec(0.0f64..10.0, 0..40),
            capacity in 1usize..30,
        ) {
            let mut history = LrHistory::with_capacity(capacity);
            for (step, loss) in losses.iter().enumerate() {
                let _ = history.record(1e-3 * (step as f64 + 1.0), *loss, step);
                prop_assert_eq!(history.lrs().len(), history.losses().len());
                prop_assert_eq!(history.len(), (step + 1).min(capacity));
            }
        }

        #[test]
        fn prop_stepper_ends_at_max_lr(
            base in 1e-6f64..1e-2,
            max in 1e-2f64..1.0,
            budget in 1usize..200,
        ) {
            let mut opt = FakeOptimizer::new(&[base]);
            let mut stepper = BatchExponentialLr::new(&opt, max, budget).unwrap();
            for _ in 0..budget {
                stepper.step(&mut opt).unwrap();
            }
            prop_assert!((opt.lrs[0] - max).abs() <= max * 1e-9);
        }
    }
}
