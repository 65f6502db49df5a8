pub mod config;
pub mod tagger;

pub use config::{TaggerConfig, FEATURE_DIM, NUM_CLASSES};
pub use tagger::AudioTagger;
