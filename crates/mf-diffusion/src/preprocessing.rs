use burn::tensor::{backend::Backend, Device, Tensor};
use image::{Rgb, Rgb32FImage};

use mf_core::error::{InferenceError, Result};
use mf_core::mask::Mask;
use mf_core::record::{blank_masked, TrainingRecord};

use crate::latent::LatentCodec;

/// Model inputs for a batch, all at latent resolution
#[derive(Clone, Debug)]
pub struct LatentInputs<B: Backend> {
    /// Encoded full image, the clean latent the model learns to recover
    pub target: Tensor<B, 4>,
    /// Encoded image with the inpaint region blanked
    pub masked: Tensor<B, 4>,
    /// `[B, 1, h, w]`, 1.0 where any covered pixel is masked
    pub mask: Tensor<B, 4>,
    /// `[B, 1, h, w]` normalized depth rescaled to `[-1, 1]`
    pub depth: Tensor<B, 4>,
}

/// Image sides must be a multiple of twice the codec downscale: the model
/// halves the latent once.
pub fn check_dimensions<C: LatentCodec>(codec: &C, width: u32, height: u32) -> Result<()> {
    let unit = (codec.downscale() * 2) as u32;
    if width == 0 || height == 0 || width % unit != 0 || height % unit != 0 {
        return Err(InferenceError::ShapeMismatch(format!(
            "{}x{} is not a multiple of {}",
            width, height, unit
        ))
        .into());
    }
    Ok(())
}

/// RGB in `[0, 1]` to `[1, 3, H, W]` in `[-1, 1]`
pub fn image_to_tensor<B: Backend>(image: &Rgb32FImage, device: &Device<B>) -> Tensor<B, 4> {
    let (w, h) = image.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in image.enumerate_pixels() {
        let idx = (y * w + x) as usize;
        for c in 0..3 {
            data[c * plane + idx] = pixel[c] * 2.0 - 1.0;
        }
    }

    Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([1, 3, h as usize, w as usize])
}

/// First item of a `[B, 3, H, W]` tensor in `[-1, 1]` back to an image in `[0, 1]`
pub fn tensor_to_image<B: Backend>(tensor: Tensor<B, 4>) -> Result<Rgb32FImage> {
    let [_, channels, h, w] = tensor.dims();
    if channels != 3 {
        return Err(InferenceError::ShapeMismatch(format!("expected 3 channels, got {}", channels)).into());
    }
    let plane = h * w;
    let values: Vec<f32> = tensor
        .slice([0..1, 0..3, 0..h, 0..w])
        .into_data()
        .iter::<f32>()
        .collect();

    Ok(Rgb32FImage::from_fn(w as u32, h as u32, |x, y| {
        let idx = y as usize * w + x as usize;
        Rgb([0, 1, 2].map(|c| ((values[c * plane + idx] + 1.0) * 0.5).clamp(0.0, 1.0)))
    }))
}

pub fn mask_to_tensor<B: Backend>(mask: &Mask, device: &Device<B>) -> Tensor<B, 4> {
    let (w, h) = mask.dimensions();
    Tensor::<B, 1>::from_floats(mask.to_f32().as_slice(), device).reshape([1, 1, h as usize, w as usize])
}

/// Average-pool normalized depth by `factor`, then map `[0, 1]` to `[-1, 1]`.
pub fn depth_to_tensor<B: Backend>(
    normalized: &[f32],
    width: u32,
    height: u32,
    factor: usize,
    device: &Device<B>,
) -> Tensor<B, 4> {
    let (w, h) = (width as usize, height as usize);
    let (lw, lh) = (w / factor, h / factor);
    let area = (factor * factor) as f32;
    let mut pooled = vec![0.0f32; lw * lh];

    for cy in 0..lh {
        for cx in 0..lw {
            let mut sum = 0.0;
            for dy in 0..factor {
                let row = (cy * factor + dy) * w;
                for dx in 0..factor {
                    sum += normalized[row + cx * factor + dx];
                }
            }
            pooled[cy * lw + cx] = sum / area * 2.0 - 1.0;
        }
    }

    Tensor::<B, 1>::from_floats(pooled.as_slice(), device).reshape([1, 1, lh, lw])
}

/// Encode one image with its inpaint mask and normalized depth.
pub fn encode_inputs<B: Backend, C: LatentCodec>(
    codec: &C,
    image: &Rgb32FImage,
    mask: &Mask,
    normalized_depth: &[f32],
    device: &Device<B>,
) -> Result<LatentInputs<B>> {
    let (w, h) = image.dimensions();
    check_dimensions(codec, w, h)?;
    if mask.dimensions() != (w, h) || normalized_depth.len() != (w * h) as usize {
        return Err(InferenceError::ShapeMismatch(format!(
            "image is {}x{}, mask is {}x{}, depth has {} values",
            w,
            h,
            mask.width(),
            mask.height(),
            normalized_depth.len()
        ))
        .into());
    }

    let factor = codec.downscale();
    Ok(LatentInputs {
        target: codec.encode(image_to_tensor(image, device)),
        masked: codec.encode(image_to_tensor(&blank_masked(image, mask), device)),
        mask: mask_to_tensor(&mask.downsample_any(factor as u32), device),
        depth: depth_to_tensor(normalized_depth, w, h, factor, device),
    })
}

/// Encode records that share one resolution into a batch.
pub fn encode_records<B: Backend, C: LatentCodec>(
    codec: &C,
    records: &[TrainingRecord],
    device: &Device<B>,
) -> Result<LatentInputs<B>> {
    let mut items = Vec::with_capacity(records.len());
    for record in records {
        items.push(encode_inputs(
            codec,
            &record.image,
            &record.inpaint_mask,
            &record.normalized_depth(),
            device,
        )?);
    }

    let dims = items.first().map(|item| item.target.dims());
    if items.iter().any(|item| Some(item.target.dims()) != dims) {
        return Err(InferenceError::ShapeMismatch("records in a batch differ in resolution".into()).into());
    }

    let mut target = Vec::with_capacity(items.len());
    let mut masked = Vec::with_capacity(items.len());
    let mut mask = Vec::with_capacity(items.len());
    let mut depth = Vec::with_capacity(items.len());
    for item in items {
        target.push(item.target);
        masked.push(item.masked);
        mask.push(item.mask);
        depth.push(item.depth);
    }

    Ok(LatentInputs {
        target: Tensor::cat(target, 0),
        masked: Tensor::cat(masked, 0),
        mask: Tensor::cat(mask, 0),
        depth: Tensor::cat(depth, 0),
    })
}
