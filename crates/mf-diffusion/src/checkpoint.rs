use std::fs;
use std::path::{Path, PathBuf};

use burn::module::{ModuleVisitor, Param};
use burn::prelude::{Backend, Device, Module};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Record, Recorder};
use burn::Tensor;
use sha2::{Digest, Sha256};

use mf_core::container::ArrayContainer;
use mf_core::error::{Error, InferenceError, Result};
use mf_core::record::DepthNormalizationConfig;

use crate::model::{Backbone, DepthAdapter, InpaintModel, InpaintModelConfig, TrainingMode};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
pub const CHECKPOINT_EXTENSION: &str = "mfck";

/// Training state at one step: the active mode's trainable parameters, the
/// optimizer state and the depth normalization the model was trained with.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub architecture_tag: String,
    pub mode: TrainingMode,
    pub step_count: usize,
    pub trainable_param_count: usize,
    pub depth_normalization: DepthNormalizationConfig,
    /// Digest of the backbone weights the checkpoint was trained against
    pub backbone_fingerprint: String,
    /// Serialized adapter record in frozen mode, full model record otherwise
    pub trainable_subset: Vec<u8>,
    pub optimizer_state: Vec<u8>,
}

impl Checkpoint {
    pub fn capture<B: Backend>(
        config: &InpaintModelConfig,
        model: &InpaintModel<B>,
        mode: TrainingMode,
        step_count: usize,
        depth_normalization: DepthNormalizationConfig,
        optimizer_state: Vec<u8>,
    ) -> Result<Self> {
        let trainable_subset = match mode {
            TrainingMode::Frozen => record_to_bytes::<B, _>(model.adapter.clone().into_record())?,
            TrainingMode::Trainable => record_to_bytes::<B, _>(model.clone().into_record())?,
        };

        Ok(Self {
            architecture_tag: config.architecture_tag(),
            mode,
            step_count,
            trainable_param_count: model.trainable_param_count(mode),
            depth_normalization,
            backbone_fingerprint: backbone_fingerprint(&model.backbone),
            trainable_subset,
            optimizer_state,
        })
    }

    /// Check the checkpoint was produced by a model built from `config`.
    pub fn verify(&self, config: &InpaintModelConfig) -> std::result::Result<(), InferenceError> {
        config.check_tag(&self.architecture_tag)
    }

    /// Load the trainable subset into `model`.
    ///
    /// A frozen-mode checkpoint only holds the adapter, so `model` must carry
    /// the exact backbone it was trained against.
    pub fn apply<B: Backend>(
        &self,
        model: InpaintModel<B>,
        config: &InpaintModelConfig,
        device: &Device<B>,
    ) -> Result<InpaintModel<B>> {
        self.verify(config)?;

        let expected = model.trainable_param_count(self.mode);
        if expected != self.trainable_param_count {
            return Err(InferenceError::CheckpointMismatch(format!(
                "{} mode checkpoint holds {} parameters, model has {}",
                self.mode, self.trainable_param_count, expected
            ))
            .into());
        }

        Ok(match self.mode {
            TrainingMode::Frozen => {
                let fingerprint = backbone_fingerprint(&model.backbone);
                if fingerprint != self.backbone_fingerprint {
                    return Err(InferenceError::CheckpointMismatch(format!(
                        "adapter was trained against backbone {}, got {}",
                        self.backbone_fingerprint, fingerprint
                    ))
                    .into());
                }
                let record = bytes_to_record::<B, <DepthAdapter<B> as Module<B>>::Record>(&self.trainable_subset, device)?;
                InpaintModel {
                    backbone: model.backbone,
                    adapter: model.adapter.load_record(record),
                }
            }
            TrainingMode::Trainable => {
                let record = bytes_to_record::<B, <InpaintModel<B> as Module<B>>::Record>(&self.trainable_subset, device)?;
                model.load_record(record)
            }
        })
    }

    pub fn to_container(&self) -> Result<ArrayContainer> {
        let mut container = ArrayContainer::new();
        container.set_attribute("format_version", &CHECKPOINT_FORMAT_VERSION)?;
        container.set_attribute("architecture_tag", &self.architecture_tag)?;
        container.set_attribute("mode", &self.mode)?;
        container.set_attribute("step_count", &self.step_count)?;
        container.set_attribute("trainable_param_count", &self.trainable_param_count)?;
        container.set_attribute("depth_normalization", &self.depth_normalization)?;
        container.set_attribute("backbone_fingerprint", &self.backbone_fingerprint)?;
        container.insert_u8("trainable_subset", &[self.trainable_subset.len()], self.trainable_subset.clone())?;
        container.insert_u8("optimizer_state", &[self.optimizer_state.len()], self.optimizer_state.clone())?;
        Ok(container)
    }

    pub fn from_container(container: &ArrayContainer) -> Result<Self> {
        let version: u32 = container.attribute("format_version")?;
        if version != CHECKPOINT_FORMAT_VERSION {
            return Err(Error::InvalidContainer(format!("checkpoint format version {}", version)));
        }

        Ok(Self {
            architecture_tag: container.attribute("architecture_tag")?,
            mode: container.attribute("mode")?,
            step_count: container.attribute("step_count")?,
            trainable_param_count: container.attribute("trainable_param_count")?,
            depth_normalization: container.attribute("depth_normalization")?,
            backbone_fingerprint: container.attribute("backbone_fingerprint")?,
            trainable_subset: container.u8("trainable_subset")?.1.to_vec(),
            optimizer_state: container.u8("optimizer_state")?.1.to_vec(),
        })
    }

    /// Atomic write; a crash leaves the previous file intact.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.to_container()?.save(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_container(&ArrayContainer::load(path)?)
    }
}

/// Directory of checkpoints named by step
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(format!("checkpoint-{:08}.{}", step, CHECKPOINT_EXTENSION))
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let path = self.path_for(checkpoint.step_count);
        checkpoint.save(&path)?;
        log::info!(
            "Saved {} checkpoint at step {} to {}",
            checkpoint.mode,
            checkpoint.step_count,
            path.display()
        );
        Ok(path)
    }

    /// Checkpoint with the highest step, ignoring unfinished temporary files
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        if !self.dir.exists() {
            return Ok(None);
        }

        let mut best: Option<(usize, PathBuf)> = None;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXTENSION) {
                continue;
            }
            let step = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix("checkpoint-"))
                .and_then(|s| s.parse::<usize>().ok());
            if let Some(step) = step {
                if best.as_ref().map_or(true, |(b, _)| step > *b) {
                    best = Some((step, path));
                }
            }
        }
        Ok(best.map(|(_, path)| path))
    }
}

/// SHA-256 over the shape and values of every backbone parameter, in module order.
pub fn backbone_fingerprint<B: Backend>(backbone: &Backbone<B>) -> String {
    let mut visitor = FingerprintVisitor { hasher: Sha256::new() };
    backbone.visit(&mut visitor);
    format!("{:x}", visitor.hasher.finalize())
}

struct FingerprintVisitor {
    hasher: Sha256,
}

impl<B: Backend> ModuleVisitor<B> for FingerprintVisitor {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor = param.val();
        for dim in tensor.dims() {
            self.hasher.update((dim as u64).to_le_bytes());
        }
        let bytes: Vec<u8> = tensor.into_data().iter::<f32>().flat_map(f32::to_le_bytes).collect();
        self.hasher.update(&bytes);
    }
}

pub(crate) fn record_to_bytes<B: Backend, R: Record<B>>(record: R) -> Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::new();
    Recorder::<B>::record(&recorder, record, ()).map_err(|e| Error::InvalidContainer(e.to_string()))
}

pub(crate) fn bytes_to_record<B: Backend, R: Record<B>>(bytes: &[u8], device: &Device<B>) -> Result<R> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::new();
    Recorder::<B>::load(&recorder, bytes.to_vec(), device)
        .map_err(|e| InferenceError::CheckpointMismatch(e.to_string()).into())
}
