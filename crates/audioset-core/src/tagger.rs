use tch::nn::{self, RNN};
use tch::Tensor;

use crate::config::TaggerConfig;

/// Recurrent audio tagger.
///
/// A stacked GRU runs over the feature frames, a small fully-connected head
/// produces per-frame class logits, and temporal max-pooling turns those into
/// clip-level logits.
#[derive(Debug)]
pub struct AudioTagger {
    gru: nn::GRU,
    fc: Vec<nn::Linear>,
    dropout: f64,
    pub config: TaggerConfig,
}

impl AudioTagger {
    pub fn new(vs: &nn::Path, config: &TaggerConfig) -> Self {
        let rnn_config = nn::RNNConfig {
            num_layers: config.num_gru_layers,
            batch_first: true,
            ..Default::default()
        };
        let gru = nn::gru(vs / "gru", config.input_dim, config.num_hidden, rnn_config);

        let num_fc = config.num_fc_layers.max(1);
        let mut fc = Vec::new();
        for i in 0..num_fc {
            let out_dim = if i + 1 == num_fc {
                config.num_classes
            } else {
                config.num_hidden
            };
            fc.push(nn::linear(vs / "fc" / i, config.num_hidden, out_dim, Default::default()));
        }

        Self {
            gru,
            fc,
            dropout: config.dropout,
            config: config.clone(),
        }
    }

    /// xs: [batch, frames, input_dim]
    /// Returns: [batch, frames, num_classes]
    pub fn frame_logits(&self, xs: &Tensor, train: bool) -> Tensor {
        let (output, _) = self.gru.seq(xs);
        let mut x = output.dropout(self.dropout, train);

        let last = self.fc.len() - 1;
        for (i, layer) in self.fc.iter().enumerate() {
            x = x.apply(layer);
            if i < last {
                x = x.relu().dropout(self.dropout, train);
            }
        }
        x
    }
}

impl nn::ModuleT for AudioTagger {
    /// Clip logits: per-frame logits max-pooled over time.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let (pooled, _) = self.frame_logits(xs, train).max_dim(1, false);
        pooled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::nn::ModuleT;
    use tch::{Device, Kind};

    fn small_config() -> TaggerConfig {
        TaggerConfig {
            num_hidden: 16,
            num_fc_layers: 3,
            ..Default::default()
        }
    }

    #[test]
    fn clip_logits_cover_every_class() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = AudioTagger::new(&vs.root(), &small_config());
        let xs = Tensor::randn([3, 8, 200], (Kind::Float, Device::Cpu));

        let logits = model.forward_t(&xs, false);
        assert_eq!(logits.size(), vec![3, 527]);
    }

    #[test]
    fn clip_logits_are_max_over_frames() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = AudioTagger::new(&vs.root(), &small_config());
        let xs = Tensor::randn([2, 5, 200], (Kind::Float, Device::Cpu));

        let frames = model.frame_logits(&xs, false);
        let clip = model.forward_t(&xs, false);
        let diff = (frames.amax([1i64].as_slice(), false) - clip).abs().max();
        assert!(diff.double_value(&[]) < 1e-6);
    }

    #[test]
    fn head_depth_follows_config() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _model = AudioTagger::new(&vs.root(), &small_config());
        let names: Vec<String> = vs.variables().into_keys().collect();
        assert!(names.iter().any(|n| n.starts_with("fc.2.")));
        assert!(!names.iter().any(|n| n.starts_with("fc.3.")));
    }
}
