use std::fs;

use anyhow::Context;
use burn::prelude::Backend;
use burn::tensor::backend::AutodiffBackend;
use clap::ValueEnum;

use mf_core::record::RecordId;
use mf_data::index::DatasetIndex;
use mf_data::{preview, GenerationPipeline};
use mf_diffusion::{
    evaluate, Backbone, Checkpoint, CheckpointStore, InpaintModel, MetricsAccumulator, Sampler,
    TrainingData, TrainingMode,
};
use mf_render::RayCastRenderer;

use crate::config::AppConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Generate,
    Train,
    Sample,
}

/// Stage selection on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StageSelection {
    /// Render scenes and append records to the dataset
    Generate,
    /// Split the dataset and train, resuming from the latest checkpoint
    Train,
    /// Reconstruct the test split and write metrics
    #[value(alias = "evaluate")]
    Sample,
    All,
}

impl StageSelection {
    pub fn stages(self) -> Vec<Stage> {
        match self {
            Self::Generate => vec![Stage::Generate],
            Self::Train => vec![Stage::Train],
            Self::Sample => vec![Stage::Sample],
            Self::All => vec![Stage::Generate, Stage::Train, Stage::Sample],
        }
    }
}

/// Runs the requested stages in order on backend `B`.
pub struct Runner<B: AutodiffBackend> {
    config: AppConfig,
    index: DatasetIndex,
    device: B::Device,
}

impl<B: AutodiffBackend> Runner<B> {
    pub fn new(config: AppConfig, device: B::Device) -> anyhow::Result<Self> {
        let index = DatasetIndex::open(config.dataset_dir())
            .with_context(|| format!("opening dataset at {}", config.dataset_dir().display()))?;
        Ok(Self { config, index, device })
    }

    pub fn run(&self, stages: &[Stage]) -> anyhow::Result<()> {
        for stage in stages {
            log::info!("=== {:?} ===", stage);
            match stage {
                Stage::Generate => self.generate()?,
                Stage::Train => self.train()?,
                Stage::Sample => self.sample()?,
            }
        }
        Ok(())
    }

    fn generate(&self) -> anyhow::Result<()> {
        let renderer = RayCastRenderer::new(self.config.render.clone());
        let generation = &self.config.generation;
        let report = GenerationPipeline::new(&renderer, generation).run(0..generation.scene_count, &self.index)?;
        log::info!("{}", report);

        let preview_dir = self.config.output_dir().join("previews");
        fs::create_dir_all(&preview_dir)?;
        for &id in report.record_ids.iter().take(4) {
            let record = self.index.get(id)?;
            let path = preview_dir.join(format!("record-{:08}.png", id));
            preview::save_record_preview(&record, &path, preview::DEFAULT_DEPTH_MAX)?;
        }

        fs::write(
            self.config.output_dir().join("generation.json"),
            serde_json::to_string_pretty(&report)?,
        )?;
        Ok(())
    }

    /// Split with the configured seed and persist the partitions
    fn split(&self) -> anyhow::Result<(Vec<RecordId>, Vec<RecordId>)> {
        let split = &self.config.split;
        let (train, test) = self.index.save_split(split.seed, split.train_fraction)?;
        log::info!(
            "Split {} records: {} train, {} test (seed {})",
            self.index.len(),
            train.len(),
            test.len(),
            split.seed
        );
        Ok((train, test))
    }

    fn train(&self) -> anyhow::Result<()> {
        let (train_ids, _) = self.split()?;
        let store = CheckpointStore::new(self.config.checkpoint_dir());
        let data = TrainingData {
            index: &self.index,
            train_ids,
            depth_normalization: self.config.generation.builder.depth_normalization,
        };

        let mut trainer = self.config.training.init::<B>(
            &self.config.model,
            self.training_backbone()?,
            data,
            store.clone(),
            &self.device,
        )?;
        if let Some(path) = store.latest()? {
            let checkpoint = Checkpoint::load(&path)?;
            trainer = trainer.resume(&checkpoint)?;
        }

        let report = trainer.run()?;
        log::info!(
            "Training finished at step {} (recent loss {:?}, {} records skipped)",
            report.final_step,
            report.recent_loss(100),
            report.skipped_records
        );
        Ok(())
    }

    /// The snapshot backbone. On a first run without a configured snapshot a
    /// random backbone is drawn and written, so later stages attach to the
    /// same weights.
    fn training_backbone(&self) -> anyhow::Result<Backbone<B>> {
        if let Some(backbone) = load_backbone::<B>(&self.config, &self.device)? {
            return Ok(backbone);
        }
        if let Some(path) = &self.config.backbone_snapshot {
            anyhow::bail!("backbone snapshot {} does not exist", path.display());
        }

        let model_config = &self.config.model;
        let model = InpaintModel::new(model_config.init_backbone(&self.device), model_config.init_adapter(&self.device));
        let snapshot = Checkpoint::capture(
            model_config,
            &model,
            TrainingMode::Trainable,
            0,
            self.config.generation.builder.depth_normalization,
            Vec::new(),
        )?;
        let path = self.config.backbone_snapshot_path();
        fs::create_dir_all(path.parent().unwrap_or(&self.config.workspace))?;
        snapshot.save(&path)?;
        log::warn!("No backbone snapshot found, wrote a random backbone to {}", path.display());
        Ok(model.backbone)
    }

    fn sample(&self) -> anyhow::Result<()> {
        let (_, test_ids) = self.split()?;
        let store = CheckpointStore::new(self.config.checkpoint_dir());
        let path = store
            .latest()?
            .with_context(|| format!("no checkpoint in {}", store.dir().display()))?;
        let checkpoint = Checkpoint::load(&path)?;

        let backbone = load_backbone::<B::InnerBackend>(&self.config, &self.device)?;
        if checkpoint.mode == TrainingMode::Frozen && backbone.is_none() {
            anyhow::bail!(
                "frozen checkpoint {} needs its backbone snapshot {}",
                path.display(),
                self.config.backbone_snapshot_path().display()
            );
        }
        let backbone = backbone.unwrap_or_else(|| self.config.model.init_backbone(&self.device));
        let sampler = Sampler::<B::InnerBackend>::from_checkpoint(
            &checkpoint,
            &self.config.model,
            backbone,
            &self.config.sampling,
            &self.device,
        )?;

        let output_dir = self.config.output_dir().join("samples");
        fs::create_dir_all(&output_dir)?;
        let sampling = &self.config.sampling;
        let limit = self.config.evaluation.max_samples.unwrap_or(test_ids.len());

        let mut metrics = MetricsAccumulator::new();
        for (i, &id) in test_ids.iter().take(limit).enumerate() {
            let record = match self.index.get(id) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("Skipping test record {}: {}", id, err);
                    continue;
                }
            };

            let reconstruction = sampler.sample(
                &record.masked_image(),
                &record.inpaint_mask,
                &record.depth,
                sampling.num_steps,
                sampling.seed.wrapping_add(id),
            )?;
            let scores = evaluate(&reconstruction, &record.image, &record.inpaint_mask)?;
            log::debug!("record {} {:?}", id, scores);
            metrics.add(&scores);

            if i < self.config.evaluation.save_images {
                let path = output_dir.join(format!("record-{:08}.png", id));
                preview::to_rgb8(&reconstruction).save(&path)?;
            }
        }

        let mean = metrics.mean();
        log::info!("Evaluated {} test records: {:?}", metrics.samples(), mean);
        fs::write(
            self.config.output_dir().join("metrics.json"),
            serde_json::to_string_pretty(&mean)?,
        )?;
        Ok(())
    }
}

/// The snapshot backbone, or `None` when the snapshot file does not exist yet.
fn load_backbone<B: Backend>(config: &AppConfig, device: &B::Device) -> anyhow::Result<Option<Backbone<B>>> {
    let path = config.backbone_snapshot_path();
    if !path.exists() {
        return Ok(None);
    }

    let model_config = &config.model;
    let snapshot = Checkpoint::load(&path).with_context(|| format!("loading {}", path.display()))?;
    if snapshot.mode != TrainingMode::Trainable {
        anyhow::bail!("backbone snapshot {} holds only an adapter", path.display());
    }
    let model = snapshot.apply(model_config.init(device), model_config, device)?;
    Ok(Some(model.backbone))
}
