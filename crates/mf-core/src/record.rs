use image::{Rgb, Rgb32FImage};
use serde::{Deserialize, Serialize};

use crate::buffers::{is_sentinel, DepthMap};
use crate::container::ArrayContainer;
use crate::error::{Error, Result};
use crate::mask::Mask;

/// Sequential, gap-free identifier assigned by the dataset index
pub type RecordId = u64;

/// How metric depth is mapped into `[0, 1]` before encoding
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DepthNormalizationConfig {
    /// Min-max over the finite depth values of each scene
    PerScene,
    /// One metric range shared by every scene
    Fixed { near: f32, far: f32 },
}

impl Default for DepthNormalizationConfig {
    fn default() -> Self {
        Self::PerScene
    }
}

impl DepthNormalizationConfig {
    pub fn resolve(&self, depth: &DepthMap) -> DepthNormalization {
        match *self {
            Self::Fixed { near, far } => DepthNormalization { near, far },
            Self::PerScene => {
                let (near, far) = depth
                    .pixels()
                    .map(|p| p.0[0])
                    .filter(|d| !is_sentinel(*d))
                    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), d| {
                        (lo.min(d), hi.max(d))
                    });
                if near.is_finite() {
                    DepthNormalization { near, far }
                } else {
                    DepthNormalization { near: 0.0, far: 1.0 }
                }
            }
        }
    }
}

/// Parameters of the depth normalization applied to one record
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DepthNormalization {
    pub near: f32,
    pub far: f32,
}

impl DepthNormalization {
    /// Map metric depth to `[0, 1]`; sentinel depth maps to `1.0` (farthest).
    pub fn normalize(&self, depth: f32) -> f32 {
        if is_sentinel(depth) {
            return 1.0;
        }
        let range = self.far - self.near;
        if range <= f32::EPSILON {
            return 0.0;
        }
        ((depth - self.near) / range).clamp(0.0, 1.0)
    }

    pub fn normalize_map(&self, depth: &DepthMap) -> Vec<f32> {
        depth.pixels().map(|p| self.normalize(p.0[0])).collect()
    }
}

/// One supervised example. Never mutated after the builder produces it.
#[derive(Clone, Debug)]
pub struct TrainingRecord {
    pub scene_id: String,
    pub image: Rgb32FImage,
    pub depth: DepthMap,
    pub inpaint_mask: Mask,
    pub mirror_mask_a: Mask,
    pub mirror_mask_b: Mask,
    pub depth_normalization: DepthNormalization,
}

impl TrainingRecord {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Pixels of `image` inside `inpaint_mask`, row-major
    pub fn target_patch(&self) -> Vec<[f32; 3]> {
        self.image
            .enumerate_pixels()
            .filter(|(x, y, _)| self.inpaint_mask.get(*x, *y))
            .map(|(_, _, p)| p.0)
            .collect()
    }

    /// The image with the reflection region blanked
    pub fn masked_image(&self) -> Rgb32FImage {
        blank_masked(&self.image, &self.inpaint_mask)
    }

    pub fn normalized_depth(&self) -> Vec<f32> {
        self.depth_normalization.normalize_map(&self.depth)
    }

    pub fn to_container(&self) -> Result<ArrayContainer> {
        let (w, h) = self.dimensions();
        let (w, h) = (w as usize, h as usize);
        let mut container = ArrayContainer::new();
        container.set_attribute("scene_id", &self.scene_id)?;
        container.set_attribute("depth_normalization", &self.depth_normalization)?;
        container.insert_f32("colors", &[h, w, 3], self.image.as_raw().clone())?;
        container.insert_f32("depth", &[h, w], self.depth.as_raw().clone())?;
        container.insert_u8("inpaint_mask", &[h, w], mask_bytes(&self.inpaint_mask))?;
        container.insert_u8("mirror_mask_a", &[h, w], mask_bytes(&self.mirror_mask_a))?;
        container.insert_u8("mirror_mask_b", &[h, w], mask_bytes(&self.mirror_mask_b))?;
        Ok(container)
    }

    pub fn from_container(container: &ArrayContainer) -> Result<Self> {
        let scene_id: String = container.attribute("scene_id")?;
        let depth_normalization = container.attribute("depth_normalization")?;

        let (shape, colors) = container.f32("colors")?;
        let (h, w) = match shape {
            [h, w, 3] => (*h as u32, *w as u32),
            _ => return Err(Error::InvalidContainer(format!("colors shape {:?}", shape))),
        };
        let image = Rgb32FImage::from_raw(w, h, colors.to_vec())
            .ok_or_else(|| Error::InvalidContainer("colors buffer size".into()))?;

        let (_, depth) = container.f32("depth")?;
        let depth = DepthMap::from_raw(w, h, depth.to_vec())
            .ok_or_else(|| Error::InvalidContainer("depth does not match colors".into()))?;

        let read_mask = |name: &str| -> Result<Mask> {
            let (_, bytes) = container.u8(name)?;
            Mask::from_vec(w, h, bytes.iter().map(|&b| b != 0).collect())
                .ok_or_else(|| Error::InvalidContainer(format!("{} does not match colors", name)))
        };

        Ok(Self {
            scene_id,
            image,
            depth,
            inpaint_mask: read_mask("inpaint_mask")?,
            mirror_mask_a: read_mask("mirror_mask_a")?,
            mirror_mask_b: read_mask("mirror_mask_b")?,
            depth_normalization,
        })
    }
}

/// Copy of `image` with masked pixels set to zero
pub fn blank_masked(image: &Rgb32FImage, mask: &Mask) -> Rgb32FImage {
    let mut out = image.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if mask.get(x, y) {
            *pixel = Rgb([0.0, 0.0, 0.0]);
        }
    }
    out
}

fn mask_bytes(mask: &Mask) -> Vec<u8> {
    mask.as_slice().iter().map(|&v| v as u8).collect()
}
