pub mod builder;
pub mod generate;
pub mod index;
pub mod preview;
pub mod renderer;
pub mod sampler;


pub use builder::{RecordBuilder, RecordBuilderConfig};
pub use generate::{GenerationConfig, GenerationPipeline, GenerationReport};
pub use index::DatasetIndex;
pub use renderer::SceneRenderer;
pub use sampler::{SceneSampler, SceneSamplerConfig};
