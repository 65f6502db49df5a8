use tch::{Device, Kind, Reduction, Tensor};

use crate::error::Result;

/// Mean binary cross-entropy over every (example, class) logit.
pub fn bce_loss(logits: &Tensor, labels: &Tensor) -> Tensor {
    logits.binary_cross_entropy_with_logits::<Tensor>(labels, None, None, Reduction::Mean)
}

/// For each example, the label bit at the arg-max class of `logits`.
///
/// logits: [batch, classes], labels: [batch, classes] multi-hot
/// Returns: [batch]
pub fn top1_correct(logits: &Tensor, labels: &Tensor) -> Tensor {
    let max_class = logits.argmax(-1, false);
    labels.gather(1, &max_class.view([-1, 1]), false).view([-1])
}

pub fn correct_flags(correct: &Tensor) -> Result<Vec<bool>> {
    let values = Vec::<f32>::try_from(correct.to_kind(Kind::Float).to_device(Device::Cpu))?;
    Ok(values.into_iter().map(|v| v > 0.5).collect())
}

/// Fraction of `true` entries; 0 for an empty slice.
pub fn accuracy(flags: &[bool]) -> f64 {
    if flags.is_empty() {
        return 0.0;
    }
    flags.iter().filter(|&&c| c).count() as f64 / flags.len() as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationSummary {
    pub val_loss: f64,
    pub val_acc: f64,
}

/// Collects per-batch validation results for one epoch.
///
/// Accuracy is computed over all examples at once, so a short final batch
/// carries exactly its own weight.
#[derive(Debug, Default)]
pub struct ValidationAccumulator {
    losses: Vec<f64>,
    correct: Vec<bool>,
}

impl ValidationAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, loss: f64, correct: &[bool]) {
        self.losses.push(loss);
        self.correct.extend_from_slice(correct);
    }

    /// `None` when no batch was pushed.
    pub fn finish(&self) -> Option<ValidationSummary> {
        if self.losses.is_empty() {
            return None;
        }
        let val_loss = self.losses.iter().sum::<f64>() / self.losses.len() as f64;
        Some(ValidationSummary {
            val_loss,
            val_acc: accuracy(&self.correct),
        })
    }
}
