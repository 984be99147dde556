use serde::{Deserialize, Serialize};

use mf_core::buffers::{is_sentinel, RenderBuffers};
use mf_core::error::DataGenerationError;
use mf_core::record::{DepthNormalizationConfig, TrainingRecord};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordBuilderConfig {
    /// Largest accepted share of masked pixels with sentinel depth
    pub max_sentinel_fraction: f32,
    pub depth_normalization: DepthNormalizationConfig,
}

impl Default for RecordBuilderConfig {
    fn default() -> Self {
        Self {
            max_sentinel_fraction: 0.4,
            depth_normalization: DepthNormalizationConfig::PerScene,
        }
    }
}

/// Turns renderer output into training records
#[derive(Clone, Debug, Default)]
pub struct RecordBuilder {
    config: RecordBuilderConfig,
}

impl RecordBuilder {
    pub fn new(config: RecordBuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RecordBuilderConfig {
        &self.config
    }

    /// Derive the inpaint mask and supervision target from `buffers`.
    pub fn build(
        &self,
        scene_id: impl Into<String>,
        buffers: RenderBuffers,
    ) -> Result<TrainingRecord, DataGenerationError> {
        buffers.check_shapes()?;

        let inpaint_mask = buffers
            .mirror_mask_a
            .union(&buffers.mirror_mask_b)
            .ok_or_else(|| DataGenerationError::ShapeMismatch("mirror masks differ".into()))?;

        let masked = inpaint_mask.count();
        if masked == 0 {
            return Err(DataGenerationError::EmptyMask);
        }

        let sentinel = buffers
            .depth
            .enumerate_pixels()
            .filter(|(x, y, d)| inpaint_mask.get(*x, *y) && is_sentinel(d.0[0]))
            .count();
        let fraction = sentinel as f32 / masked as f32;
        if fraction > self.config.max_sentinel_fraction {
            return Err(DataGenerationError::DepthSentinel {
                fraction,
                limit: self.config.max_sentinel_fraction,
            });
        }

        let depth_normalization = self.config.depth_normalization.resolve(&buffers.depth);

        Ok(TrainingRecord {
            scene_id: scene_id.into(),
            image: buffers.rgb,
            depth: buffers.depth,
            inpaint_mask,
            mirror_mask_a: buffers.mirror_mask_a,
            mirror_mask_b: buffers.mirror_mask_b,
            depth_normalization,
        })
    }
}
