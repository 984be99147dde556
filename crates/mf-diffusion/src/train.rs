use std::collections::HashSet;
use std::path::PathBuf;

use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::{Backend, Device};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use burn::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mf_core::error::{self, Error, InferenceError, TrainingError};
use mf_core::progress::ProgressTracker;
use mf_core::record::{DepthNormalizationConfig, RecordId, TrainingRecord};
use mf_data::index::DatasetIndex;

use crate::checkpoint::{bytes_to_record, record_to_bytes, Checkpoint, CheckpointStore};
use crate::latent::PatchCodec;
use crate::model::{Backbone, DenoiseInput, InpaintModel, InpaintModelConfig, TrainingMode};
use crate::preprocessing::encode_records;
use crate::schedule::{gaussian_noise, NoiseSchedule, NoiseScheduleConfig};

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub mode: TrainingMode,

    #[config(default = 20000)]
    pub num_steps: usize,

    #[config(default = "1e-4")]
    pub learning_rate: f64,

    #[config(default = 4)]
    pub batch_size: usize,

    /// Steps between checkpoints; `0` keeps only the final one
    #[config(default = 1000)]
    pub checkpoint_interval: usize,

    #[config(default = 0)]
    pub seed: u64,

    #[config(default = "NoiseScheduleConfig::new()")]
    pub schedule: NoiseScheduleConfig,
}

impl TrainingConfig {
    /// Step budget and learning rate preset for `mode`
    pub fn for_mode(mode: TrainingMode) -> Self {
        Self::new(mode)
            .with_num_steps(mode.default_steps())
            .with_learning_rate(mode.default_learning_rate())
    }

    /// Build a trainer around `backbone` with an Adam optimizer.
    pub fn init<'a, B: AutodiffBackend>(
        &self,
        model_config: &InpaintModelConfig,
        backbone: Backbone<B>,
        data: TrainingData<'a>,
        store: CheckpointStore,
        device: &Device<B>,
    ) -> error::Result<Trainer<'a, B, impl Optimizer<InpaintModel<B>, B> + use<'a, B>>> {
        let optimizer = AdamConfig::new()
            .with_epsilon(1e-8)
            .init::<B, InpaintModel<B>>();
        Trainer::new(self.clone(), model_config.clone(), backbone, optimizer, data, store, device)
    }
}

/// Where training records come from
pub struct TrainingData<'a> {
    pub index: &'a DatasetIndex,
    pub train_ids: Vec<RecordId>,
    /// Normalization the records were built with; stored in checkpoints
    pub depth_normalization: DepthNormalizationConfig,
}

#[derive(Clone, Debug, Default)]
pub struct TrainingReport {
    /// Loss of every step run by this call, in order
    pub losses: Vec<f32>,
    pub checkpoints: Vec<PathBuf>,
    pub final_step: usize,
    pub skipped_records: usize,
}

impl TrainingReport {
    /// Mean loss over the last `window` steps
    pub fn recent_loss(&self, window: usize) -> Option<f32> {
        let tail = &self.losses[self.losses.len().saturating_sub(window)..];
        if tail.is_empty() {
            return None;
        }
        Some(tail.iter().sum::<f32>() / tail.len() as f32)
    }
}

/// Sequential noise-prediction training over the train partition.
///
/// The backbone is moved in once at construction. In frozen mode it stops
/// tracking gradients, so every update touches the depth adapter only.
pub struct Trainer<'a, B: AutodiffBackend, O: Optimizer<InpaintModel<B>, B>> {
    config: TrainingConfig,
    model_config: InpaintModelConfig,
    model: InpaintModel<B>,
    optimizer: O,
    data: TrainingData<'a>,
    store: CheckpointStore,
    codec: PatchCodec,
    schedule: NoiseSchedule,
    rng: StdRng,
    step: usize,
    /// Step of the newest checkpoint on disk for this run
    last_saved: Option<usize>,
    /// Ids that failed to load since the last successful load
    failed_ids: HashSet<RecordId>,
    /// Distinct ids in the train partition
    partition_size: usize,
    skipped_records: usize,
    device: Device<B>,
}

impl<'a, B: AutodiffBackend, O: Optimizer<InpaintModel<B>, B>> Trainer<'a, B, O> {
    pub fn new(
        config: TrainingConfig,
        model_config: InpaintModelConfig,
        backbone: Backbone<B>,
        optimizer: O,
        data: TrainingData<'a>,
        store: CheckpointStore,
        device: &Device<B>,
    ) -> error::Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".into()));
        }
        if config.learning_rate <= 0.0 {
            return Err(Error::InvalidConfig("learning_rate must be positive".into()));
        }

        let model = InpaintModel::new(backbone, model_config.init_adapter(device)).with_mode(config.mode);
        log::info!(
            "Training {} in {} mode: {} trainable of {} parameters",
            model_config.architecture_tag(),
            config.mode,
            model.trainable_param_count(config.mode),
            model.trainable_param_count(TrainingMode::Trainable)
        );

        let partition_size = data.train_ids.iter().collect::<HashSet<_>>().len();
        Ok(Self {
            codec: model_config.codec(),
            schedule: config.schedule.init(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            model_config,
            model,
            optimizer,
            data,
            store,
            step: 0,
            last_saved: None,
            failed_ids: HashSet::new(),
            partition_size,
            skipped_records: 0,
            device: device.clone(),
        })
    }

    /// Continue from `checkpoint`: trainable values, optimizer state and step count.
    pub fn resume(mut self, checkpoint: &Checkpoint) -> error::Result<Self> {
        if checkpoint.mode != self.config.mode {
            return Err(InferenceError::CheckpointMismatch(format!(
                "checkpoint was trained in {} mode, run is {}",
                checkpoint.mode, self.config.mode
            ))
            .into());
        }
        if checkpoint.depth_normalization != self.data.depth_normalization {
            log::warn!(
                "Resuming with depth normalization {:?}, checkpoint used {:?}",
                self.data.depth_normalization,
                checkpoint.depth_normalization
            );
        }

        self.model = checkpoint.apply(self.model, &self.model_config, &self.device)?;
        let record = bytes_to_record::<B, O::Record>(&checkpoint.optimizer_state, &self.device)?;
        self.optimizer = self.optimizer.load_record(record);
        self.step = checkpoint.step_count;
        self.last_saved = Some(checkpoint.step_count);

        log::info!("Resumed {} training at step {}", self.config.mode, self.step);
        Ok(self)
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn model(&self) -> &InpaintModel<B> {
        &self.model
    }

    /// Inference copy of the current parameters
    pub fn valid_model(&self) -> InpaintModel<B::InnerBackend> {
        self.model.valid()
    }

    pub fn into_model(self) -> InpaintModel<B> {
        self.model
    }

    /// Run until `num_steps`, checkpointing every `checkpoint_interval` steps
    /// and once more at the end. A step that already has a checkpoint is never
    /// written again.
    pub fn run(&mut self) -> error::Result<TrainingReport> {
        let total = self.config.num_steps;
        let mut progress = ProgressTracker::new(total).starting_at(self.step);
        let mut report = TrainingReport::default();

        while self.step < total {
            let loss = self.train_step()?;
            report.losses.push(loss);
            log::debug!("step {} loss {:.6}", self.step, loss);
            progress.step(format!("loss {:.5}", loss));

            let interval = self.config.checkpoint_interval;
            if interval > 0 && self.step % interval == 0 {
                report.checkpoints.push(self.save_checkpoint()?);
            }
        }

        if self.last_saved != Some(self.step) {
            report.checkpoints.push(self.save_checkpoint()?);
        }

        report.final_step = self.step;
        report.skipped_records = self.skipped_records;
        Ok(report)
    }

    /// One update on a freshly sampled batch; returns the loss before the update.
    pub fn train_step(&mut self) -> error::Result<f32> {
        let records = self.sample_batch()?;
        let inputs = encode_records::<B, _>(&self.codec, &records, &self.device)?;

        let timesteps: Vec<usize> = (0..records.len())
            .map(|_| self.rng.gen_range(0..self.schedule.num_train_timesteps()))
            .collect();
        let noise = gaussian_noise::<B>(&mut self.rng, inputs.target.dims(), &self.device);
        let noisy = self.schedule.add_noise(inputs.target, noise.clone(), &timesteps);
        let t: Vec<f32> = timesteps.iter().map(|&t| t as f32).collect();

        let prediction = self.model.forward(DenoiseInput {
            noisy_latent: noisy,
            timesteps: Tensor::from_floats(t.as_slice(), &self.device),
            masked_latent: inputs.masked,
            mask: inputs.mask.clone(),
            depth: inputs.depth,
            context: None,
        });
        let loss = masked_mse(prediction, noise, inputs.mask);
        let value = loss.clone().into_scalar().elem::<f32>();

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self
            .optimizer
            .step(self.config.learning_rate, self.model.clone(), grads);
        self.step += 1;

        Ok(value)
    }

    pub fn checkpoint(&self) -> error::Result<Checkpoint> {
        let optimizer_state = record_to_bytes::<B, _>(self.optimizer.to_record())?;
        Checkpoint::capture(
            &self.model_config,
            &self.model,
            self.config.mode,
            self.step,
            self.data.depth_normalization,
            optimizer_state,
        )
    }

    pub fn save_checkpoint(&mut self) -> error::Result<PathBuf> {
        let path = self.store.save(&self.checkpoint()?)?;
        self.last_saved = Some(self.step);
        Ok(path)
    }

    /// Uniform draw with replacement. Unloadable records are skipped; once
    /// every id in the partition has failed without a successful load in
    /// between, the dataset is unusable.
    fn sample_batch(&mut self) -> error::Result<Vec<TrainingRecord>> {
        let ids = &self.data.train_ids;
        if ids.is_empty() {
            return Err(TrainingError::EmptyTrainSplit.into());
        }

        let mut batch = Vec::with_capacity(self.config.batch_size);
        while batch.len() < self.config.batch_size {
            let id = ids[self.rng.gen_range(0..ids.len())];
            match self.data.index.get(id) {
                Ok(record) => {
                    self.failed_ids.clear();
                    batch.push(record);
                }
                Err(err) => {
                    log::warn!("Skipping record {}: {}", id, err);
                    self.skipped_records += 1;
                    self.failed_ids.insert(id);
                    if self.failed_ids.len() >= self.partition_size {
                        return Err(TrainingError::DatasetCorrupt {
                            failures: self.failed_ids.len(),
                        }
                        .into());
                    }
                }
            }
        }
        Ok(batch)
    }
}

/// Mean squared error restricted to `mask`.
///
/// `mask` is `[B, 1, h, w]` and broadcasts over channels. Cells outside the
/// mask contribute nothing; an all-false mask yields exactly zero.
pub fn masked_mse<B: Backend>(prediction: Tensor<B, 4>, target: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 1> {
    let [_, channels, _, _] = prediction.dims();
    let squared = (prediction - target).powf_scalar(2.0) * mask.clone();
    let count = mask.sum().mul_scalar(channels as f32).clamp_min(1.0);
    squared.sum() / count
}
