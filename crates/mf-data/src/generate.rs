use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use mf_core::error::{DataGenerationError, DatasetIndexError, Error, Result};
use mf_core::progress::ProgressTracker;
use mf_core::record::{RecordId, TrainingRecord};
use mf_core::scene::DescriptorPolicy;

use crate::builder::{RecordBuilder, RecordBuilderConfig};
use crate::index::DatasetIndex;
use crate::renderer::SceneRenderer;
use crate::sampler::{SceneSampler, SceneSamplerConfig};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub seed: u64,
    pub scene_count: u64,
    /// Scenes rendered in parallel before their records are written
    pub chunk_size: usize,
    pub sampler: SceneSamplerConfig,
    pub policy: DescriptorPolicy,
    pub builder: RecordBuilderConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            scene_count: 100,
            chunk_size: 32,
            sampler: SceneSamplerConfig::default(),
            policy: DescriptorPolicy::default(),
            builder: RecordBuilderConfig::default(),
        }
    }
}

/// Counts of scenes attempted, written and rejected by reason
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub rejected: BTreeMap<String, usize>,
    pub record_ids: Vec<RecordId>,
}

impl GenerationReport {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }

    fn reject(&mut self, reason: &str) {
        *self.rejected.entry(reason.to_string()).or_default() += 1;
    }
}

impl fmt::Display for GenerationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={} succeeded={} rejected={}",
            self.attempted,
            self.succeeded,
            self.rejected_total()
        )?;
        for (reason, count) in &self.rejected {
            write!(f, " {}={}", reason, count)?;
        }
        Ok(())
    }
}

/// Scene → render → record → index, with per-scene failures isolated.
pub struct GenerationPipeline<'a, R: SceneRenderer + ?Sized> {
    renderer: &'a R,
    sampler: SceneSampler,
    builder: RecordBuilder,
    policy: DescriptorPolicy,
    chunk_size: usize,
}

impl<'a, R: SceneRenderer + ?Sized> GenerationPipeline<'a, R> {
    pub fn new(renderer: &'a R, config: &GenerationConfig) -> Self {
        Self {
            renderer,
            sampler: SceneSampler::new(config.sampler.clone(), config.seed),
            builder: RecordBuilder::new(config.builder.clone()),
            policy: config.policy.clone(),
            chunk_size: config.chunk_size.max(1),
        }
    }

    /// Render one scene and build its record
    pub fn produce(&self, index: u64) -> std::result::Result<TrainingRecord, DataGenerationError> {
        let scene = self.sampler.descriptor(index);
        scene.validate(&self.policy)?;
        let buffers = self.renderer.render(&scene)?;
        self.builder.build(scene.scene_id, buffers)
    }

    /// Generate scenes `range` into `index`.
    ///
    /// Rendering runs on the rayon pool; records are added to the index on the
    /// calling thread in scene order, so ids follow scene indices.
    pub fn run(&self, range: Range<u64>, index: &DatasetIndex) -> Result<GenerationReport> {
        let total = (range.end.saturating_sub(range.start)) as usize;
        log::info!(
            "Generating {} scenes with renderer '{}'",
            total,
            self.renderer.name()
        );

        let mut report = GenerationReport::default();
        let mut progress = ProgressTracker::new(total);
        let scenes: Vec<u64> = range.collect();

        for chunk in scenes.chunks(self.chunk_size) {
            let produced: Vec<_> = chunk
                .par_iter()
                .map(|&i| (i, self.produce(i)))
                .collect();

            for (i, outcome) in produced {
                report.attempted += 1;
                match outcome {
                    Ok(record) => match index.add(&record) {
                        Ok(id) => {
                            report.succeeded += 1;
                            report.record_ids.push(id);
                        }
                        Err(Error::DatasetIndex(DatasetIndexError::DuplicateId(scene))) => {
                            log::warn!("Scene {} skipped: already indexed", scene);
                            report.reject("duplicate_id");
                        }
                        Err(e) => return Err(e),
                    },
                    Err(e) => {
                        log::warn!("Scene {} rejected: {}", i, e);
                        report.reject(e.reason());
                    }
                }
                progress.step(format!("scene {}", i));
            }
        }

        log::info!("Generation finished: {}", report);
        Ok(report)
    }
}
