use burn::config::Config;
use burn::prelude::{Backend, Device};
use burn::Tensor;
use image::Rgb32FImage;
use rand::rngs::StdRng;
use rand::SeedableRng;

use mf_core::buffers::DepthMap;
use mf_core::error::{self, InferenceError};
use mf_core::mask::Mask;
use mf_core::record::DepthNormalizationConfig;

use crate::checkpoint::Checkpoint;
use crate::latent::{LatentCodec, PatchCodec};
use crate::model::{Backbone, DenoiseInput, InpaintModel, InpaintModelConfig};
use crate::preprocessing::{encode_inputs, tensor_to_image, LatentInputs};
use crate::schedule::{gaussian_noise, NoiseSchedule, NoiseScheduleConfig};

#[derive(Config, Debug)]
pub struct SamplerConfig {
    #[config(default = 50)]
    pub num_steps: usize,

    /// `0` is deterministic DDIM, `1` ancestral sampling
    #[config(default = 0.0)]
    pub eta: f64,

    #[config(default = 0)]
    pub seed: u64,

    #[config(default = "NoiseScheduleConfig::new()")]
    pub schedule: NoiseScheduleConfig,
}

/// Reconstructs the inpaint region of an image from its surroundings and depth.
///
/// Read-only on parameters: one sampler can serve concurrent calls.
pub struct Sampler<B: Backend> {
    model: InpaintModel<B>,
    codec: PatchCodec,
    schedule: NoiseSchedule,
    depth_normalization: DepthNormalizationConfig,
    eta: f64,
    context: Option<Tensor<B, 3>>,
    device: Device<B>,
}

impl<B: Backend> Sampler<B> {
    pub fn new(
        model: InpaintModel<B>,
        model_config: &InpaintModelConfig,
        depth_normalization: DepthNormalizationConfig,
        config: &SamplerConfig,
        device: &Device<B>,
    ) -> Self {
        Self {
            model,
            codec: model_config.codec(),
            schedule: config.schedule.init(),
            depth_normalization,
            eta: config.eta.max(0.0),
            context: None,
            device: device.clone(),
        }
    }

    /// Attach `checkpoint` to `backbone`, rejecting checkpoints of another
    /// architecture and frozen-mode adapters trained on another backbone.
    pub fn from_checkpoint(
        checkpoint: &Checkpoint,
        model_config: &InpaintModelConfig,
        backbone: Backbone<B>,
        config: &SamplerConfig,
        device: &Device<B>,
    ) -> error::Result<Self> {
        let model = InpaintModel::new(backbone, model_config.init_adapter(device));
        let model = checkpoint.apply(model, model_config, device)?;
        Ok(Self::new(model, model_config, checkpoint.depth_normalization, config, device))
    }

    /// Semantic conditioning tokens `[1, T, context_dim]` for every call
    pub fn with_context(mut self, context: Tensor<B, 3>) -> Self {
        self.context = Some(context);
        self
    }

    /// Inpaint `mask` in `image`. Pixels outside the mask are returned
    /// untouched; an empty mask returns the input as is.
    pub fn sample(
        &self,
        image: &Rgb32FImage,
        mask: &Mask,
        depth: &DepthMap,
        num_steps: usize,
        seed: u64,
    ) -> error::Result<Rgb32FImage> {
        check_shapes(image, mask, depth)?;
        if mask.is_empty() {
            return Ok(image.clone());
        }

        let latent = self.denoise_steps(image, mask, depth, num_steps, seed)?.finish();
        let decoded = tensor_to_image(self.codec.decode(latent))?;
        Ok(composite(image, &decoded, mask))
    }

    /// Lazy denoising loop yielding the latent after every step.
    pub fn denoise_steps(
        &self,
        image: &Rgb32FImage,
        mask: &Mask,
        depth: &DepthMap,
        num_steps: usize,
        seed: u64,
    ) -> error::Result<DenoiseSteps<'_, B>> {
        check_shapes(image, mask, depth)?;
        let normalization = self.depth_normalization.resolve(depth);
        let inputs = encode_inputs(&self.codec, image, mask, &normalization.normalize_map(depth), &self.device)?;

        let mut rng = StdRng::seed_from_u64(seed);
        let timesteps = self.schedule.sampling_timesteps(num_steps);
        let latent = match timesteps.first() {
            Some(&t) => {
                let noise = gaussian_noise::<B>(&mut rng, inputs.masked.dims(), &self.device);
                self.schedule.add_noise(inputs.masked.clone(), noise, &[t])
            }
            None => inputs.masked.clone(),
        };

        Ok(DenoiseSteps {
            sampler: self,
            inputs,
            latent,
            timesteps,
            position: 0,
            rng,
        })
    }
}

/// Remaining denoising steps of one sampling call.
///
/// After every model update the cells outside the latent mask are replaced by
/// the known latent, noised to the level of the next step; the last step
/// re-injects it exactly.
pub struct DenoiseSteps<'a, B: Backend> {
    sampler: &'a Sampler<B>,
    inputs: LatentInputs<B>,
    latent: Tensor<B, 4>,
    timesteps: Vec<usize>,
    position: usize,
    rng: StdRng,
}

impl<B: Backend> DenoiseSteps<'_, B> {
    pub fn latent(&self) -> &Tensor<B, 4> {
        &self.latent
    }

    pub fn remaining(&self) -> usize {
        self.timesteps.len() - self.position
    }

    /// Drive the remaining steps and return the final latent.
    pub fn finish(mut self) -> Tensor<B, 4> {
        for _ in self.by_ref() {}
        self.latent
    }
}

impl<B: Backend> Iterator for DenoiseSteps<'_, B> {
    type Item = Tensor<B, 4>;

    fn next(&mut self) -> Option<Self::Item> {
        let t = *self.timesteps.get(self.position)?;
        let t_prev = self.timesteps.get(self.position + 1).copied();
        let sampler = self.sampler;
        let schedule = &sampler.schedule;
        let device = &sampler.device;

        let predicted_noise = sampler.model.forward(DenoiseInput {
            noisy_latent: self.latent.clone(),
            timesteps: Tensor::from_floats([t as f32], device),
            masked_latent: self.inputs.masked.clone(),
            mask: self.inputs.mask.clone(),
            depth: self.inputs.depth.clone(),
            context: sampler.context.clone(),
        });

        let dims = self.latent.dims();
        let rng = &mut self.rng;
        let denoised = schedule.ddim_step(
            self.latent.clone(),
            predicted_noise,
            schedule.alpha_bar(Some(t)),
            schedule.alpha_bar(t_prev),
            sampler.eta,
            || gaussian_noise::<B>(rng, dims, device),
        );

        let known = match t_prev {
            Some(t_prev) => {
                let noise = gaussian_noise::<B>(&mut self.rng, dims, device);
                schedule.add_noise(self.inputs.masked.clone(), noise, &[t_prev])
            }
            None => self.inputs.masked.clone(),
        };
        let mask = self.inputs.mask.clone();
        self.latent = denoised * mask.clone() + known * mask.neg().add_scalar(1.0);
        self.position += 1;

        Some(self.latent.clone())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

impl<B: Backend> ExactSizeIterator for DenoiseSteps<'_, B> {}

/// Original pixels outside `mask`, `generated` inside
pub fn composite(original: &Rgb32FImage, generated: &Rgb32FImage, mask: &Mask) -> Rgb32FImage {
    let mut out = original.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if mask.get(x, y) {
            *pixel = *generated.get_pixel(x, y);
        }
    }
    out
}

fn check_shapes(image: &Rgb32FImage, mask: &Mask, depth: &DepthMap) -> error::Result<()> {
    if image.dimensions() != mask.dimensions() || image.dimensions() != depth.dimensions() {
        return Err(InferenceError::ShapeMismatch(format!(
            "image {:?}, mask {:?}, depth {:?}",
            image.dimensions(),
            mask.dimensions(),
            depth.dimensions()
        ))
        .into());
    }
    Ok(())
}
