use image::{ImageBuffer, Luma, Rgb32FImage};

use crate::error::DataGenerationError;
use crate::mask::Mask;

/// Per-pixel metric depth. Background pixels hold [`DEPTH_SENTINEL`].
pub type DepthMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Depth value written where a primary ray hits nothing
pub const DEPTH_SENTINEL: f32 = f32::INFINITY;

pub fn is_sentinel(depth: f32) -> bool {
    !depth.is_finite()
}

/// Raw renderer output for one scene. Read-only once produced.
#[derive(Clone, Debug)]
pub struct RenderBuffers {
    pub rgb: Rgb32FImage,
    pub depth: DepthMap,
    pub mirror_mask_a: Mask,
    pub mirror_mask_b: Mask,
}

impl RenderBuffers {
    pub fn dimensions(&self) -> (u32, u32) {
        self.rgb.dimensions()
    }

    /// Every buffer must share the RGB dimensions.
    pub fn check_shapes(&self) -> Result<(), DataGenerationError> {
        let dims = self.rgb.dimensions();
        let others = [
            ("depth", self.depth.dimensions()),
            ("mirror_mask_a", self.mirror_mask_a.dimensions()),
            ("mirror_mask_b", self.mirror_mask_b.dimensions()),
        ];
        for (name, other) in others {
            if other != dims {
                return Err(DataGenerationError::ShapeMismatch(format!(
                    "{} is {}x{}, rgb is {}x{}",
                    name, other.0, other.1, dims.0, dims.1
                )));
            }
        }
        if dims.0 == 0 || dims.1 == 0 {
            return Err(DataGenerationError::ShapeMismatch("zero-sized buffers".into()));
        }
        Ok(())
    }
}
