use anyhow::Result;
use clap::Parser;
use log::info;
use tch::Device;

use trainer::{HParams, RunOutcome, Trainer};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let hparams = HParams::parse();
    hparams.validate()?;

    tch::set_num_threads(hparams.num_threads()?);
    let device = Device::cuda_if_available();
    info!("Using device: {:?}", device);

    let mut trainer = Trainer::new(hparams, device)?;

    match trainer.fit()? {
        RunOutcome::LrTestComplete { plot } => {
            info!("LR range test complete, plot at {}", plot.display());
        }
        RunOutcome::Completed {
            epochs,
            best_val_loss,
        } => match best_val_loss {
            Some(loss) => info!("Training complete after {} epochs, best val_loss {:.4}", epochs, loss),
            None => info!("Training complete after {} epochs", epochs),
        },
    }

    Ok(())
}
