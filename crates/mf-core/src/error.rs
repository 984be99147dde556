use thiserror::Error;

use crate::record::RecordId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Data generation failed: {0}")]
    DataGeneration(#[from] DataGenerationError),

    #[error("Dataset index error: {0}")]
    DatasetIndex(#[from] DatasetIndexError),

    #[error("Training failed: {0}")]
    Training(#[from] TrainingError),

    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid container: {0}")]
    InvalidContainer(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),
}

/// Scene-level failures. The scene is skipped, the pipeline continues.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataGenerationError {
    #[error("no mirror pixel is visible")]
    EmptyMask,

    #[error("{fraction:.3} of masked pixels have sentinel depth (limit {limit:.3})")]
    DepthSentinel { fraction: f32, limit: f32 },

    #[error("render failed: {0}")]
    Render(#[from] RenderFailure),

    #[error("degenerate scene: {0}")]
    DegenerateScene(String),

    #[error("buffer shape mismatch: {0}")]
    ShapeMismatch(String),
}

impl DataGenerationError {
    /// Short stable name used when counting rejections.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::EmptyMask => "empty_mask",
            Self::DepthSentinel { .. } => "depth_sentinel",
            Self::Render(RenderFailure::AssetMissing(_)) => "asset_missing",
            Self::Render(RenderFailure::DegenerateGeometry(_)) => "degenerate_geometry",
            Self::Render(RenderFailure::Backend(_)) => "render_backend",
            Self::DegenerateScene(_) => "degenerate_scene",
            Self::ShapeMismatch(_) => "shape_mismatch",
        }
    }
}

/// Signal returned by a renderer in place of buffers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderFailure {
    #[error("asset not found: {0}")]
    AssetMissing(String),

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("renderer backend: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatasetIndexError {
    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("scene {0} is already indexed")]
    DuplicateId(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error("every record in the train partition failed to load ({failures} records)")]
    DatasetCorrupt { failures: usize },

    #[error("train partition is empty")]
    EmptyTrainSplit,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("checkpoint does not match the configured model: {0}")]
    CheckpointMismatch(String),

    #[error("unknown architecture tag: {0}")]
    UnknownArchitecture(String),

    #[error("input shape mismatch: {0}")]
    ShapeMismatch(String),
}
