use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use log::debug;
use memmap2::MmapOptions;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use safetensors::SafeTensors;
use tch::{Device, Kind, Tensor};

use crate::error::{ConfigError, Result, TrainError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

pub struct Batch {
    /// [batch, window, feature_dim]
    pub audio: Tensor,
    /// [batch, classes], multi-hot
    pub label: Tensor,
}

/// Reads every tensor of a safetensors file into CPU tensors.
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Tensor>> {
    let file = File::open(path.as_ref())?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut out = HashMap::new();
    for (name, view) in tensors.tensors() {
        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        let kind = match view.dtype() {
            safetensors::Dtype::F32 => Kind::Float,
            safetensors::Dtype::F64 => Kind::Double,
            safetensors::Dtype::F16 => Kind::Half,
            safetensors::Dtype::BF16 => Kind::BFloat16,
            safetensors::Dtype::U8 => Kind::Uint8,
            other => {
                return Err(TrainError::Dataset(format!(
                    "unsupported dtype {:?} for tensor {}",
                    other, name
                )))
            }
        };
        out.insert(name, Tensor::from_data_size(view.data(), &shape, kind));
    }
    Ok(out)
}

/// Pre-extracted AudioSet features for one split.
///
/// `<root>/<split>.safetensors` must hold `features` [clips, frames, dim] and
/// `labels` [clips, classes].
pub struct AudioSetDataset {
    split: Split,
    features: Tensor,
    labels: Tensor,
    frames: i64,
    window: i64,
}

impl AudioSetDataset {
    pub fn load(split: Split, root: &Path, window: i64) -> Result<Self> {
        let path = root.join(format!("{}.safetensors", split.as_str()));
        let mut tensors = load_safetensors(&path)?;
        let mut take = |name: &str| {
            tensors.remove(name).ok_or_else(|| {
                TrainError::Dataset(format!("{} has no `{}` tensor", path.display(), name))
            })
        };
        let features = take("features")?;
        let labels = take("labels")?;
        Self::from_tensors(split, features, labels, window)
    }

    pub fn from_tensors(split: Split, features: Tensor, labels: Tensor, window: i64) -> Result<Self> {
        let (clips, frames, _dim) = features.size3()?;
        let (label_rows, _classes) = labels.size2()?;
        if clips != label_rows {
            return Err(TrainError::Dataset(format!(
                "{} features for {} labels",
                clips, label_rows
            )));
        }
        if frames < window {
            return Err(TrainError::Dataset(format!(
                "clips have {} frames, shorter than the {}-frame window",
                frames, window
            )));
        }
        debug!("{} split: {} clips of {} frames", split.as_str(), clips, frames);

        Ok(Self {
            split,
            features: features.to_kind(Kind::Float),
            labels: labels.to_kind(Kind::Float),
            frames,
            window,
        })
    }

    pub fn len(&self) -> usize {
        self.features.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Train windows start at a random frame, validation windows are centred.
    fn window_start(&self, rng: &mut impl Rng) -> i64 {
        let slack = self.frames - self.window;
        match self.split {
            Split::Train => rng.gen_range(0..=slack),
            Split::Val => slack / 2,
        }
    }

    pub fn batch(&self, indices: &[i64], rng: &mut impl Rng) -> Batch {
        let crops: Vec<Tensor> = indices
            .iter()
            .map(|&i| {
                let start = self.window_start(rng);
                self.features.get(i).narrow(0, start, self.window)
            })
            .collect();
        let audio = Tensor::stack(&crops, 0);
        let label = self.labels.index_select(0, &Tensor::from_slice(indices));
        Batch { audio, label }
    }
}

/// Indices seen by `rank` out of `world_size` processes. The index list is
/// padded by wrapping around so that every rank gets the same count.
pub fn shard_indices(indices: &[usize], rank: usize, world_size: usize) -> Vec<usize> {
    if indices.is_empty() || world_size == 0 {
        return Vec::new();
    }
    let per_rank = indices.len().div_ceil(world_size);
    let total = per_rank * world_size;
    indices
        .iter()
        .cycle()
        .take(total)
        .skip(rank)
        .step_by(world_size)
        .copied()
        .collect()
}

/// Reads `RANK` and `WORLD_SIZE`, defaulting to a single process.
pub fn world_from_env() -> Result<(usize, usize)> {
    fn read(name: &'static str, default: usize) -> Result<usize> {
        match std::env::var(name) {
            Ok(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { name, value }.into()),
            Err(_) => Ok(default),
        }
    }
    let rank = read("RANK", 0)?;
    let world_size = read("WORLD_SIZE", 1)?;
    if world_size == 0 || rank >= world_size {
        return Err(ConfigError::InvalidEnv {
            name: "RANK",
            value: format!("{} (world size {})", rank, world_size),
        }
        .into());
    }
    Ok((rank, world_size))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    Sequential,
    Shuffled,
    /// Shard across processes; ranks shuffle with the same per-epoch seed so
    /// their shards stay disjoint.
    Distributed {
        rank: usize,
        world_size: usize,
        shuffle: bool,
    },
}

pub struct DataLoader {
    dataset: AudioSetDataset,
    batch_size: usize,
    sampling: Sampling,
    seed: u64,
    rng: StdRng,
    device: Device,
}

impl DataLoader {
    pub fn new(
        dataset: AudioSetDataset,
        batch_size: usize,
        sampling: Sampling,
        seed: u64,
        device: Device,
    ) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            sampling,
            seed,
            rng: StdRng::seed_from_u64(seed),
            device,
        }
    }

    pub fn epoch_indices(&mut self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        match self.sampling {
            Sampling::Sequential => indices,
            Sampling::Shuffled => {
                indices.shuffle(&mut self.rng);
                indices
            }
            Sampling::Distributed {
                rank,
                world_size,
                shuffle,
            } => {
                if shuffle {
                    let mut epoch_rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
                    indices.shuffle(&mut epoch_rng);
                }
                shard_indices(&indices, rank, world_size)
            }
        }
    }

    /// Index chunks for one epoch; the last batch may be short.
    pub fn epoch_batches(&mut self, epoch: usize) -> Vec<Vec<i64>> {
        self.epoch_indices(epoch)
            .chunks(self.batch_size)
            .map(|chunk| chunk.iter().map(|&i| i as i64).collect())
            .collect()
    }

    pub fn load_batch(&mut self, indices: &[i64]) -> Batch {
        let batch = self.dataset.batch(indices, &mut self.rng);
        Batch {
            audio: batch.audio.to_device(self.device),
            label: batch.label.to_device(self.device),
        }
    }
}
