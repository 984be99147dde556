pub mod checkpoint;
pub mod evaluate;
pub mod latent;
pub mod model;
pub mod preprocessing;
pub mod sampler;
pub mod schedule;
pub mod train;

#[cfg(test)]
mod tests;

pub use checkpoint::{backbone_fingerprint, Checkpoint, CheckpointStore};
pub use evaluate::{evaluate, Metrics, MetricsAccumulator};
pub use latent::{LatentCodec, PatchCodec};
pub use model::{Backbone, DepthAdapter, InpaintModel, InpaintModelConfig, TrainingMode};
pub use sampler::{DenoiseSteps, Sampler, SamplerConfig};
pub use schedule::{NoiseSchedule, NoiseScheduleConfig};
pub use train::{masked_mse, Trainer, TrainingConfig, TrainingData, TrainingReport};
