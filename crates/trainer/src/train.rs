use std::path::PathBuf;

use audioset_core::AudioTagger;
use log::{info, warn};
use tch::nn::{self, ModuleT};
use tch::Device;

use crate::checkpoint::Checkpointer;
use crate::config::HParams;
use crate::dataset::{world_from_env, AudioSetDataset, Batch, DataLoader, Sampling, Split};
use crate::error::{Result, TrainError};
use crate::metrics::{accuracy, bce_loss, correct_flags, top1_correct, ValidationAccumulator, ValidationSummary};
use crate::module::{StepOutcome, TaggingModule};
use crate::optim::{ParamGroups, TaggerOptimizer};

/// How a call to [`Trainer::fit`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        epochs: usize,
        best_val_loss: Option<f64>,
    },
    /// The LR range test finished and wrote its plot; no training was done
    /// beyond the sweep.
    LrTestComplete { plot: PathBuf },
}

pub struct Trainer {
    hparams: HParams,
    model: AudioTagger,
    optimizer: TaggerOptimizer,
    module: TaggingModule,
    checkpointer: Checkpointer,
    device: Device,
    vs: nn::VarStore,
}

impl Trainer {
    pub fn new(hparams: HParams, device: Device) -> Result<Self> {
        hparams.validate()?;
        tch::manual_seed(hparams.seed as i64);

        let vs = nn::VarStore::new(device);
        let model_config = hparams.tagger_config();
        let model = AudioTagger::new(&vs.root(), &model_config);

        let mut optimizer = TaggerOptimizer::new(&vs, hparams.optimizer, hparams.learning_rate)?;

        let checkpointer = Checkpointer::new(&hparams.checkpoint_path)?;
        checkpointer.save_hparams(&hparams, &model_config)?;

        let mut module = TaggingModule::new(checkpointer.lr_plot_path());
        module.configure_optimizers(&hparams, &mut optimizer)?;

        Ok(Self {
            hparams,
            model,
            optimizer,
            module,
            checkpointer,
            device,
            vs,
        })
    }

    fn loaders(&self) -> Result<(DataLoader, DataLoader)> {
        let hp = &self.hparams;
        let (train_sampling, val_sampling) = if hp.distributed {
            let (rank, world_size) = world_from_env()?;
            warn!(
                "Distributed mode: rank {} of {} trains on its data shard only; gradients are not synchronised",
                rank, world_size
            );
            (
                Sampling::Distributed { rank, world_size, shuffle: true },
                Sampling::Distributed { rank, world_size, shuffle: false },
            )
        } else {
            (Sampling::Shuffled, Sampling::Sequential)
        };

        let train = AudioSetDataset::load(Split::Train, &hp.dataset_path, hp.window)?;
        let val = AudioSetDataset::load(Split::Val, &hp.dataset_path, hp.window)?;
        info!("Loaded {} train / {} val clips", train.len(), val.len());

        Ok((
            DataLoader::new(train, hp.batch_size, train_sampling, hp.seed, self.device),
            DataLoader::new(val, hp.batch_size, val_sampling, hp.seed, self.device),
        ))
    }

    pub fn fit(&mut self) -> Result<RunOutcome> {
        let (mut train_loader, mut val_loader) = self.loaders()?;
        info!("Starting training with configuration: {:?}", self.hparams);

        for epoch in 0..self.hparams.max_nb_epochs {
            if let Some(plot) = self.train_epoch(epoch, &mut train_loader)? {
                return Ok(RunOutcome::LrTestComplete { plot });
            }

            let summary = self.validate(&mut val_loader)?;
            info!(
                "Epoch {} | val_loss: {:.4} | val_acc: {:.4} | lr: {:.3e}",
                epoch,
                summary.val_loss,
                summary.val_acc,
                self.current_lr()
            );

            self.checkpointer
                .on_validation_end(&self.vs, epoch, summary.val_loss)?;
            self.module.on_epoch_end(&mut self.optimizer, summary.val_loss)?;
        }

        if self.hparams.test_lr {
            warn!(
                "Epoch budget ran out after {} of {} LR range test steps; no plot written",
                self.module.history().len(),
                self.hparams.lr_test_steps
            );
        }

        Ok(RunOutcome::Completed {
            epochs: self.hparams.max_nb_epochs,
            best_val_loss: self.checkpointer.best_val_loss(),
        })
    }

    fn current_lr(&self) -> f64 {
        self.optimizer.learning_rates().first().copied().unwrap_or_default()
    }

    /// Returns the plot path if the LR range test completed during this epoch.
    fn train_epoch(&mut self, epoch: usize, loader: &mut DataLoader) -> Result<Option<PathBuf>> {
        let batches = loader.epoch_batches(epoch);
        let num_batches = batches.len();
        let mut epoch_loss = 0.0;

        for (batch_idx, indices) in batches.iter().enumerate() {
            let batch = loader.load_batch(indices);
            let (loss, acc) = self.training_step(&batch)?;
            epoch_loss += loss;

            if batch_idx % self.hparams.log_interval == 0 {
                info!(
                    "Epoch {} | Batch {}/{} | loss: {:.4} | train_acc: {:.4} | lr: {:.3e}",
                    epoch,
                    batch_idx,
                    num_batches,
                    loss,
                    acc,
                    self.current_lr()
                );
            }

            if let StepOutcome::TestComplete { plot } = self.module.on_batch_end(&mut self.optimizer)? {
                return Ok(Some(plot));
            }
        }

        if num_batches > 0 {
            info!("Epoch {} average loss: {:.4}", epoch, epoch_loss / num_batches as f64);
        }
        Ok(None)
    }

    /// Forward, loss, history bookkeeping, then one optimizer update.
    fn training_step(&mut self, batch: &Batch) -> Result<(f64, f64)> {
        let logits = self.model.forward_t(&batch.audio, true);
        let loss = bce_loss(&logits, &batch.label);

        let correct = correct_flags(&top1_correct(&logits, &batch.label))?;
        let loss_value = loss.double_value(&[]);

        self.module.on_train_step(loss_value)?;
        self.optimizer.backward_step(&loss);

        Ok((loss_value, accuracy(&correct)))
    }

    fn validate(&mut self, loader: &mut DataLoader) -> Result<ValidationSummary> {
        let _guard = tch::no_grad_guard();
        let mut acc = ValidationAccumulator::new();

        for indices in loader.epoch_batches(0) {
            let batch = loader.load_batch(&indices);
            let logits = self.model.forward_t(&batch.audio, false);
            let loss = bce_loss(&logits, &batch.label).double_value(&[]);
            let correct = correct_flags(&top1_correct(&logits, &batch.label))?;
            acc.push(loss, &correct);
        }

        acc.finish()
            .ok_or_else(|| TrainError::Dataset("validation split produced no batches".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tch::{Kind, Tensor};

    fn write_split(dir: &std::path::Path, split: &str, clips: i64) {
        let features = Tensor::randn([clips, 12, 200], (Kind::Float, Device::Cpu));
        let labels = Tensor::zeros([clips, 527], (Kind::Float, Device::Cpu));
        let _ = labels.narrow(1, 0, 1).fill_(1.0);
        Tensor::write_safetensors(
            &[("features", &features), ("labels", &labels)],
            dir.join(format!("{}.safetensors", split)),
        )
        .unwrap();
    }

    fn hparams(dir: &std::path::Path, extra: &[&str]) -> HParams {
        let data = dir.join("data");
        std::fs::create_dir_all(&data).unwrap();
        write_split(&data, "train", 12);
        write_split(&data, "val", 5);

        let data = data.to_string_lossy().into_owned();
        let ckpt = dir.join("ckpt").to_string_lossy().into_owned();
        let mut argv = vec![
            "audioset-train".to_string(),
            "--dataset-path".to_string(),
            data,
            "--checkpoint-path".to_string(),
            ckpt,
            "--batch-size".to_string(),
            "4".to_string(),
            "--num-hidden".to_string(),
            "8".to_string(),
            "--window".to_string(),
            "8".to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        HParams::parse_from(argv)
    }

    #[test]
    fn lr_test_run_ends_with_plot() {
        let dir = tempfile::tempdir().unwrap();
        let hp = hparams(
            dir.path(),
            &["--test-lr", "--learning-rate", "0.0001", "--lr-test-steps", "5", "--max-nb-epochs", "3"],
        );

        let mut trainer = Trainer::new(hp, Device::Cpu).unwrap();
        let outcome = trainer.fit().unwrap();

        let plot = dir.path().join("ckpt").join("lr_finder.svg");
        assert_eq!(outcome, RunOutcome::LrTestComplete { plot: plot.clone() });
        assert!(plot.exists());
    }

    #[test]
    fn short_training_run_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let hp = hparams(dir.path(), &["--scheduler", "exp", "--max-nb-epochs", "2", "--learning-rate", "0.01"]);

        let mut trainer = Trainer::new(hp, Device::Cpu).unwrap();
        let outcome = trainer.fit().unwrap();

        match outcome {
            RunOutcome::Completed { epochs, best_val_loss } => {
                assert_eq!(epochs, 2);
                assert!(best_val_loss.is_some());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(dir.path().join("ckpt").join("hparams.yaml").exists());
        assert!((trainer.current_lr() - 0.0025).abs() < 1e-12);
    }
}
