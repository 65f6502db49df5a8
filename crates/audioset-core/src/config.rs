use serde::{Deserialize, Serialize};

/// Width of one input feature frame.
pub const FEATURE_DIM: i64 = 200;
/// Number of AudioSet sound-event classes.
pub const NUM_CLASSES: i64 = 527;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggerConfig {
    /// Dimension of each feature frame fed to the GRU.
    pub input_dim: i64,
    /// Hidden width of the GRU and of the hidden fully-connected layers.
    pub num_hidden: i64,
    /// Number of stacked GRU layers.
    pub num_gru_layers: i64,
    /// Number of output classes (multi-label).
    pub num_classes: i64,
    /// Number of linear layers in the head, including the output projection.
    pub num_fc_layers: i64,
    /// Dropout probability on GRU outputs and hidden head activations.
    pub dropout: f64,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            input_dim: FEATURE_DIM,
            num_hidden: 256,
            num_gru_layers: 2,
            num_classes: NUM_CLASSES,
            num_fc_layers: 2,
            dropout: 0.5,
        }
    }
}
