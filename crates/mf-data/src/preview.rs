//! Quick-look images for dataset samples.

use std::path::Path;

use image::{imageops, GrayImage, Luma, Rgb, Rgb32FImage, RgbImage};

use mf_core::buffers::DepthMap;
use mf_core::error::Result;
use mf_core::mask::Mask;
use mf_core::record::TrainingRecord;

/// Depth beyond which the colormap saturates, in scene units
pub const DEFAULT_DEPTH_MAX: f32 = 5.0;

pub fn to_rgb8(image: &Rgb32FImage) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y).0;
        Rgb([quantize(p[0]), quantize(p[1]), quantize(p[2])])
    })
}

/// Colormap depth with the "summer" ramp: near is green, far is yellow.
/// Sentinel depth saturates at `depth_max`.
pub fn depth_preview(depth: &DepthMap, depth_max: f32) -> RgbImage {
    RgbImage::from_fn(depth.width(), depth.height(), |x, y| {
        let d = depth.get_pixel(x, y).0[0];
        let v = if d.is_finite() {
            (d / depth_max.max(f32::EPSILON)).clamp(0.0, 1.0)
        } else {
            1.0
        };
        Rgb([quantize(v), quantize(0.5 + 0.5 * v), quantize(0.4)])
    })
}

pub fn mask_preview(mask: &Mask) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([if mask.get(x, y) { 255 } else { 0 }])
    })
}

/// One full-size image on top and up to three thumbnails at a third of its
/// size underneath, on a white background.
pub fn image_grid(full: &RgbImage, thumbnails: &[RgbImage]) -> RgbImage {
    let (w, h) = full.dimensions();
    let (tw, th) = ((w / 3).max(1), (h / 3).max(1));
    let mut grid = RgbImage::from_pixel(w, h + th, Rgb([255, 255, 255]));
    imageops::replace(&mut grid, full, 0, 0);

    for (i, thumb) in thumbnails.iter().take(3).enumerate() {
        let small = imageops::resize(thumb, tw, th, imageops::FilterType::Triangle);
        imageops::replace(&mut grid, &small, (i as u32 * tw) as i64, h as i64);
    }
    grid
}

/// Grid of the rendered image with its depth, mask and masked input
pub fn record_preview(record: &TrainingRecord, depth_max: f32) -> RgbImage {
    let mask = image::DynamicImage::ImageLuma8(mask_preview(&record.inpaint_mask)).to_rgb8();
    image_grid(
        &to_rgb8(&record.image),
        &[
            depth_preview(&record.depth, depth_max),
            mask,
            to_rgb8(&record.masked_image()),
        ],
    )
}

pub fn save_record_preview(record: &TrainingRecord, path: &Path, depth_max: f32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    record_preview(record, depth_max).save(path)?;
    Ok(())
}

fn quantize(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}
