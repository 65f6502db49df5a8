use tch::nn::{self, OptimizerConfig};
use tch::Tensor;

use crate::config::OptimizerKind;
use crate::error::Result;

pub const ADAM_WEIGHT_DECAY: f64 = 1e-4;
pub const SGD_MOMENTUM: f64 = 0.9;
pub const SGD_WEIGHT_DECAY: f64 = 5e-4;

/// Per-group learning-rate access, the seam between schedulers and the
/// optimizer they drive.
pub trait ParamGroups {
    /// Current learning rate of every parameter group, in group order.
    fn learning_rates(&self) -> Vec<f64>;

    fn set_learning_rate(&mut self, group: usize, lr: f64);

    /// Ignored by optimizers without momentum.
    fn set_momentum(&mut self, _group: usize, _momentum: f64) {}
}

/// `tch::nn::Optimizer` does not expose its learning rates, so they are
/// mirrored here and kept in sync on every write.
pub struct TaggerOptimizer {
    inner: nn::Optimizer,
    kind: OptimizerKind,
    lrs: Vec<f64>,
}

impl TaggerOptimizer {
    pub fn new(vs: &nn::VarStore, kind: OptimizerKind, lr: f64) -> Result<Self> {
        let inner = match kind {
            OptimizerKind::Adam => nn::Adam {
                wd: ADAM_WEIGHT_DECAY,
                ..Default::default()
            }
            .build(vs, lr)?,
            OptimizerKind::Sgd => nn::Sgd {
                momentum: SGD_MOMENTUM,
                wd: SGD_WEIGHT_DECAY,
                ..Default::default()
            }
            .build(vs, lr)?,
        };

        Ok(Self {
            inner,
            kind,
            // a VarStore-built optimizer has a single parameter group
            lrs: vec![lr],
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) {
        self.inner.backward_step(loss);
    }
}

impl ParamGroups for TaggerOptimizer {
    fn learning_rates(&self) -> Vec<f64> {
        self.lrs.clone()
    }

    fn set_learning_rate(&mut self, group: usize, lr: f64) {
        if let Some(slot) = self.lrs.get_mut(group) {
            *slot = lr;
            self.inner.set_lr_group(group, lr);
        }
    }

    fn set_momentum(&mut self, group: usize, momentum: f64) {
        if self.kind == OptimizerKind::Sgd && group < self.lrs.len() {
            self.inner.set_momentum_group(group, momentum);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn learning_rate_writes_are_mirrored() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _w = vs.root().var("w", &[4], nn::Init::Const(1.0));
        let mut opt = TaggerOptimizer::new(&vs, OptimizerKind::Sgd, 0.3).unwrap();

        assert_eq!(opt.learning_rates(), vec![0.3]);
        opt.set_learning_rate(0, 0.01);
        assert_eq!(opt.learning_rates(), vec![0.01]);
        // out-of-range groups are ignored
        opt.set_learning_rate(3, 1.0);
        assert_eq!(opt.learning_rates(), vec![0.01]);
    }
}
