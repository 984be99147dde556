pub mod geometry;
pub mod renderer;

#[cfg(test)]
mod tests;

pub use renderer::{Asset, RayCastConfig, RayCastRenderer};
