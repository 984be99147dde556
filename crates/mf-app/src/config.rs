use std::fs;
use std::path::{Path, PathBuf};

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use mf_data::GenerationConfig;
use mf_diffusion::{InpaintModelConfig, SamplerConfig, TrainingConfig, TrainingMode};
use mf_render::RayCastConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Cpu,
    Wgpu,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub seed: u64,
    pub train_fraction: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            train_fraction: 0.9,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Test records to reconstruct; `None` means all of them
    pub max_samples: Option<usize>,
    /// Reconstructions written as PNG next to the metrics
    pub save_images: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_samples: None,
            save_images: 8,
        }
    }
}

/// Every stage of a run, read from one JSON file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root for the dataset, checkpoints and outputs
    pub workspace: PathBuf,

    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub render: RayCastConfig,

    #[serde(default)]
    pub split: SplitConfig,

    #[serde(default = "InpaintModelConfig::new", deserialize_with = "partial_model")]
    pub model: InpaintModelConfig,

    /// Trainable-mode checkpoint whose backbone seeds the run. Without one,
    /// training writes a random backbone to `checkpoints/backbone.mfck` and
    /// every later stage reuses it.
    #[serde(default)]
    pub backbone_snapshot: Option<PathBuf>,

    #[serde(default = "default_training", deserialize_with = "partial_training")]
    pub training: TrainingConfig,

    #[serde(default = "SamplerConfig::new", deserialize_with = "partial_sampling")]
    pub sampling: SamplerConfig,

    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

fn default_training() -> TrainingConfig {
    TrainingConfig::for_mode(TrainingMode::Frozen)
}

// Model, training and sampling sections may name any subset of their fields;
// the rest keep the values of `base`.
fn overlay<T: Serialize + DeserializeOwned>(base: &T, section: Value) -> serde_json::Result<T> {
    let mut merged = serde_json::to_value(base)?;
    merge(&mut merged, section);
    serde_json::from_value(merged)
}

fn merge(base: &mut Value, section: Value) {
    match (base, section) {
        (Value::Object(base), Value::Object(section)) => {
            for (key, value) in section {
                merge(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, section) => *base = section,
    }
}

fn partial_model<'de, D: Deserializer<'de>>(deserializer: D) -> Result<InpaintModelConfig, D::Error> {
    overlay(&InpaintModelConfig::new(), Value::deserialize(deserializer)?).map_err(D::Error::custom)
}

/// The mode picks the step budget and learning rate the section starts from.
fn partial_training<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TrainingConfig, D::Error> {
    let section = Value::deserialize(deserializer)?;
    let mode = match section.get("mode") {
        Some(mode) => serde_json::from_value(mode.clone()).map_err(D::Error::custom)?,
        None => TrainingMode::Frozen,
    };
    overlay(&TrainingConfig::for_mode(mode), section).map_err(D::Error::custom)
}

fn partial_sampling<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SamplerConfig, D::Error> {
    overlay(&SamplerConfig::new(), Value::deserialize(deserializer)?).map_err(D::Error::custom)
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.split.train_fraction) {
            anyhow::bail!("split.train_fraction must be in [0, 1], got {}", self.split.train_fraction);
        }
        if self.model.hidden_channels % self.model.norm_groups != 0 {
            anyhow::bail!(
                "model.hidden_channels ({}) must be divisible by model.norm_groups ({})",
                self.model.hidden_channels,
                self.model.norm_groups
            );
        }
        if self.model.hidden_channels % self.model.attention_heads != 0 {
            anyhow::bail!("model.hidden_channels must be divisible by model.attention_heads");
        }
        let unit = 2 * self.model.patch_size as u32;
        let sampler = &self.generation.sampler;
        if sampler.image_width % unit != 0 || sampler.image_height % unit != 0 {
            anyhow::bail!(
                "image size {}x{} must be a multiple of {} for patch size {}",
                sampler.image_width,
                sampler.image_height,
                unit,
                self.model.patch_size
            );
        }
        Ok(())
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.workspace.join("dataset")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.workspace.join("checkpoints").join(self.training.mode.as_str())
    }

    pub fn output_dir(&self) -> PathBuf {
        self.workspace.join("outputs")
    }

    /// Configured snapshot, or the one training writes on first run
    pub fn backbone_snapshot_path(&self) -> PathBuf {
        match &self.backbone_snapshot {
            Some(path) => path.clone(),
            None => self.workspace.join("checkpoints").join("backbone.mfck"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{ "workspace": "/tmp/mf" }"#).unwrap();

        assert_eq!(config.backend, BackendKind::Cpu);
        assert_eq!(config.training.mode, TrainingMode::Frozen);
        assert_eq!(config.training.num_steps, 20_000);
        assert_eq!(config.sampling.num_steps, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sections_override_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "workspace": "/tmp/mf",
                "backend": "wgpu",
                "training": { "mode": "trainable", "num_steps": 10, "learning_rate": 2e-5 },
                "split": { "train_fraction": 0.5 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::Wgpu);
        assert_eq!(config.training.mode, TrainingMode::Trainable);
        assert_eq!(config.training.num_steps, 10);
        assert_eq!(config.split.train_fraction, 0.5);
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/tmp/mf/checkpoints/trainable"));
    }

    #[test]
    fn test_loads_readme_example() {
        let readme = include_str!("../../../README.md");
        let json = readme
            .split("```json")
            .nth(1)
            .and_then(|rest| rest.split("```").next())
            .unwrap();
        let path = std::env::temp_dir().join(format!("mf-app-readme-{}.json", std::process::id()));
        fs::write(&path, json).unwrap();

        let config = AppConfig::load(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(config.generation.scene_count, 2000);
        assert_eq!(config.generation.sampler.image_width, 128);
        assert_eq!(config.training.mode, TrainingMode::Frozen);
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.training.checkpoint_interval, 1000);
        assert_eq!(config.sampling.num_steps, 50);
        assert_eq!(config.sampling.seed, 0);
        assert_eq!(config.model, InpaintModelConfig::new());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "workspace": "/tmp/mf",
                "model": { "hidden_channels": 32 },
                "training": { "mode": "trainable" },
                "sampling": { "eta": 1.0, "schedule": { "num_train_timesteps": 500 } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.model.hidden_channels, 32);
        assert_eq!(config.model.patch_size, 4);
        assert_eq!(config.training.num_steps, 15_000);
        assert_eq!(config.training.learning_rate, 2e-5);
        assert_eq!(config.sampling.eta, 1.0);
        assert_eq!(config.sampling.num_steps, 50);
        assert_eq!(config.sampling.schedule.num_train_timesteps, 500);
        assert_eq!(config.backbone_snapshot_path(), PathBuf::from("/tmp/mf/checkpoints/backbone.mfck"));
    }

    #[test]
    fn test_rejects_image_size_off_patch_grid() {
        let mut config: AppConfig = serde_json::from_str(r#"{ "workspace": "/tmp/mf" }"#).unwrap();
        config.generation.sampler.image_width = 100;
        assert!(config.validate().is_err());
    }
}
