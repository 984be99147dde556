use burn::prelude::Backend;
use burn::Tensor;

/// Maps `[-1, 1]` RGB images to the latent space the model denoises in, and back.
pub trait LatentCodec {
    fn latent_channels(&self) -> usize;

    /// Pixel size of one latent cell along each axis
    fn downscale(&self) -> usize;

    /// `[B, 3, H, W] -> [B, C, H / f, W / f]`
    fn encode<B: Backend>(&self, pixels: Tensor<B, 4>) -> Tensor<B, 4>;

    /// `[B, C, h, w] -> [B, 3, h * f, w * f]`
    fn decode<B: Backend>(&self, latent: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Lossless space-to-depth codec: every `p x p` pixel patch becomes `3 p^2`
/// latent channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchCodec {
    patch_size: usize,
}

impl PatchCodec {
    pub fn new(patch_size: usize) -> Self {
        Self {
            patch_size: patch_size.max(1),
        }
    }

    pub fn channels_for(patch_size: usize) -> usize {
        3 * patch_size * patch_size
    }
}

impl Default for PatchCodec {
    fn default() -> Self {
        Self::new(4)
    }
}

impl LatentCodec for PatchCodec {
    fn latent_channels(&self) -> usize {
        Self::channels_for(self.patch_size)
    }

    fn downscale(&self) -> usize {
        self.patch_size
    }

    fn encode<B: Backend>(&self, pixels: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = pixels.dims();
        let p = self.patch_size;
        let (lh, lw) = (h / p, w / p);

        pixels
            .reshape([b * c, lh, p, lw, p])
            .permute([0, 2, 4, 1, 3])
            .reshape([b, c * p * p, lh, lw])
    }

    fn decode<B: Backend>(&self, latent: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, channels, lh, lw] = latent.dims();
        let p = self.patch_size;
        let c = channels / (p * p);

        latent
            .reshape([b * c, p, p, lh, lw])
            .permute([0, 3, 1, 4, 2])
            .reshape([b, c, lh * p, lw * p])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_patch_codec_is_lossless() {
        let device = Default::default();
        let codec = PatchCodec::new(2);
        let values: Vec<f32> = (0..2 * 3 * 4 * 6).map(|v| v as f32).collect();
        let pixels = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device).reshape([2, 3, 4, 6]);

        let latent = codec.encode(pixels);
        assert_eq!(latent.dims(), [2, 12, 2, 3]);

        let decoded: Vec<f32> = codec.decode(latent).into_data().iter::<f32>().collect();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_patch_codec_groups_patches() {
        let device = Default::default();
        let codec = PatchCodec::new(2);
        // one channel-plane of a 2x2 image is a single latent cell
        let pixels = Tensor::<TestBackend, 1>::from_floats([1.0f32, 2.0, 3.0, 4.0].repeat(3).as_slice(), &device)
            .reshape([1, 3, 2, 2]);

        let latent: Vec<f32> = codec.encode(pixels).into_data().iter::<f32>().collect();
        assert_eq!(&latent[..4], &[1.0, 2.0, 3.0, 4.0]);
    }
}
