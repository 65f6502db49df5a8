use std::fs;
use std::path::{Path, PathBuf};

use audioset_core::TaggerConfig;
use log::info;
use tch::nn;

use crate::config::HParams;
use crate::error::Result;

pub const LR_PLOT_FILE: &str = "lr_finder.svg";

/// Writes run metadata and keeps the weights of the best validation epoch.
pub struct Checkpointer {
    dir: PathBuf,
    best_val_loss: Option<f64>,
}

impl Checkpointer {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            dir,
            best_val_loss: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lr_plot_path(&self) -> PathBuf {
        self.dir.join(LR_PLOT_FILE)
    }

    /// `hparams.yaml` and `model_config.json` next to the checkpoints.
    pub fn save_hparams(&self, hparams: &HParams, model: &TaggerConfig) -> Result<()> {
        fs::write(self.dir.join("hparams.yaml"), serde_yaml::to_string(hparams)?)?;
        fs::write(
            self.dir.join("model_config.json"),
            serde_json::to_string_pretty(model)?,
        )?;
        Ok(())
    }

    pub fn is_improvement(&self, val_loss: f64) -> bool {
        match self.best_val_loss {
            _ if !val_loss.is_finite() => false,
            Some(best) => val_loss < best,
            None => true,
        }
    }

    /// Saves `vs` when `val_loss` is the best seen so far.
    pub fn on_validation_end(
        &mut self,
        vs: &nn::VarStore,
        epoch: usize,
        val_loss: f64,
    ) -> Result<Option<PathBuf>> {
        if !self.is_improvement(val_loss) {
            return Ok(None);
        }
        self.best_val_loss = Some(val_loss);

        let path = self
            .dir
            .join(format!("epoch={}-val_loss={:.4}.ot", epoch, val_loss));
        vs.save(&path)?;
        info!("Saved checkpoint to {:?}", path);
        Ok(Some(path))
    }

    pub fn best_val_loss(&self) -> Option<f64> {
        self.best_val_loss
    }
}
