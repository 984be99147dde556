pub mod buffers;
pub mod camera;
pub mod container;
pub mod error;
pub mod mask;
pub mod progress;
pub mod record;
pub mod scene;


pub use error::{Error, Result};
