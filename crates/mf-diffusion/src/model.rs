use burn::config::Config;
use burn::nn::attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig};
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::{Backend, Device, Module};
use burn::tensor::activation::silu;
use burn::Tensor;
use serde::{Deserialize, Serialize};

use mf_core::error::InferenceError;

use crate::latent::{LatentCodec, PatchCodec};

pub const ARCHITECTURE_FAMILY: &str = "mf-depth-inpaint";

/// Architecture hyperparameters. Two models with the same tag can exchange
/// checkpoints.
#[derive(Config, Debug, PartialEq)]
pub struct InpaintModelConfig {
    /// Pixel patch folded into one latent cell
    #[config(default = 4)]
    pub patch_size: usize,

    #[config(default = 64)]
    pub hidden_channels: usize,

    #[config(default = 32)]
    pub adapter_channels: usize,

    #[config(default = 8)]
    pub norm_groups: usize,

    #[config(default = 64)]
    pub time_embed_dim: usize,

    /// Width of the optional semantic conditioning tokens
    #[config(default = 64)]
    pub context_dim: usize,

    #[config(default = 4)]
    pub attention_heads: usize,
}

impl InpaintModelConfig {
    pub fn codec(&self) -> PatchCodec {
        PatchCodec::new(self.patch_size)
    }

    pub fn latent_channels(&self) -> usize {
        self.codec().latent_channels()
    }

    pub fn architecture_tag(&self) -> String {
        format!(
            "{}/p{}-h{}-a{}-g{}-t{}-x{}-n{}",
            ARCHITECTURE_FAMILY,
            self.patch_size,
            self.hidden_channels,
            self.adapter_channels,
            self.norm_groups,
            self.time_embed_dim,
            self.context_dim,
            self.attention_heads
        )
    }

    /// Reject tags from another architecture family before comparing details.
    pub fn check_tag(&self, tag: &str) -> Result<(), InferenceError> {
        match tag.split_once('/') {
            Some((family, _)) if family == ARCHITECTURE_FAMILY => {}
            _ => return Err(InferenceError::UnknownArchitecture(tag.to_string())),
        }
        let expected = self.architecture_tag();
        if tag != expected {
            return Err(InferenceError::CheckpointMismatch(format!(
                "architecture {} but model is configured as {}",
                tag, expected
            )));
        }
        Ok(())
    }

    pub fn init_backbone<B: Backend>(&self, device: &Device<B>) -> Backbone<B> {
        let hidden = self.hidden_channels;
        // sin and cos halves
        let time_embed_dim = 2 * (self.time_embed_dim / 2).max(1);
        let conv3 = |input: usize, output: usize| {
            Conv2dConfig::new([input, output], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        Backbone {
            conv_in: conv3(2 * self.latent_channels() + 1, hidden),
            time_in: LinearConfig::new(time_embed_dim, hidden).init(device),
            time_out: LinearConfig::new(hidden, hidden).init(device),
            down_block: self.init_res_block(device),
            downsample: Conv2dConfig::new([hidden, hidden], [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            mid_block: self.init_res_block(device),
            mid_attention: CrossAttention {
                norm: LayerNormConfig::new(hidden).init(device),
                context_proj: LinearConfig::new(self.context_dim, hidden).init(device),
                attention: MultiHeadAttentionConfig::new(hidden, self.attention_heads)
                    .with_dropout(0.0)
                    .init(device),
            },
            upsample: ConvTranspose2dConfig::new([hidden, hidden], [2, 2])
                .with_stride([2, 2])
                .init(device),
            up_block: self.init_res_block(device),
            norm_out: GroupNormConfig::new(self.norm_groups, hidden).init(device),
            conv_out: conv3(hidden, self.latent_channels()),
            time_embed_dim,
        }
    }

    /// Adapter whose output convolutions start at zero, so a fresh adapter
    /// leaves the backbone prediction untouched.
    pub fn init_adapter<B: Backend>(&self, device: &Device<B>) -> DepthAdapter<B> {
        let (adapter, hidden) = (self.adapter_channels, self.hidden_channels);
        let padding = PaddingConfig2d::Explicit(1, 1);

        DepthAdapter {
            encode_in: Conv2dConfig::new([1, adapter], [3, 3])
                .with_padding(padding.clone())
                .init(device),
            encode_out: Conv2dConfig::new([adapter, adapter], [3, 3])
                .with_padding(padding.clone())
                .init(device),
            fuse_in: Conv2dConfig::new([adapter, hidden], [3, 3])
                .with_padding(padding.clone())
                .with_initializer(Initializer::Zeros)
                .init(device),
            fuse_mid: Conv2dConfig::new([adapter, hidden], [3, 3])
                .with_stride([2, 2])
                .with_padding(padding)
                .with_initializer(Initializer::Zeros)
                .init(device),
        }
    }

    pub fn init<B: Backend>(&self, device: &Device<B>) -> InpaintModel<B> {
        InpaintModel {
            backbone: self.init_backbone(device),
            adapter: self.init_adapter(device),
        }
    }

    fn init_res_block<B: Backend>(&self, device: &Device<B>) -> ResBlock<B> {
        let hidden = self.hidden_channels;
        let conv3 = || {
            Conv2dConfig::new([hidden, hidden], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        ResBlock {
            norm_1: GroupNormConfig::new(self.norm_groups, hidden).init(device),
            conv_1: conv3(),
            time: LinearConfig::new(hidden, hidden).init(device),
            norm_2: GroupNormConfig::new(self.norm_groups, hidden).init(device),
            conv_2: conv3(),
        }
    }
}

/// Which parameters the optimizer may touch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// Backbone fixed, only the depth adapter learns
    Frozen,
    /// Backbone and adapter learn together
    Trainable,
}

impl TrainingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Frozen => "frozen",
            Self::Trainable => "trainable",
        }
    }

    pub fn default_steps(&self) -> usize {
        match self {
            Self::Frozen => 20_000,
            Self::Trainable => 15_000,
        }
    }

    pub fn default_learning_rate(&self) -> f64 {
        match self {
            Self::Frozen => 1e-4,
            Self::Trainable => 2e-5,
        }
    }
}

impl std::fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    pub norm_1: GroupNorm<B>,
    pub conv_1: Conv2d<B>,
    pub time: Linear<B>,
    pub norm_2: GroupNorm<B>,
    pub conv_2: Conv2d<B>,
}

impl<B: Backend> ResBlock<B> {
    /// `x: [B, C, H, W]`, `time: [B, C]`
    pub fn forward(&self, x: Tensor<B, 4>, time: Tensor<B, 2>) -> Tensor<B, 4> {
        let [b, c, _, _] = x.dims();
        let h = self.conv_1.forward(silu(self.norm_1.forward(x.clone())));
        let h = h + self.time.forward(silu(time)).reshape([b, c, 1, 1]);
        let h = self.conv_2.forward(silu(self.norm_2.forward(h)));
        x + h
    }
}

/// Cross-attention from image tokens to semantic conditioning tokens
#[derive(Module, Debug)]
pub struct CrossAttention<B: Backend> {
    pub norm: LayerNorm<B>,
    pub context_proj: Linear<B>,
    pub attention: MultiHeadAttention<B>,
}

impl<B: Backend> CrossAttention<B> {
    /// Identity when `context` is `None`
    pub fn forward(&self, x: Tensor<B, 4>, context: Option<Tensor<B, 3>>) -> Tensor<B, 4> {
        let Some(context) = context else {
            return x;
        };
        let [b, c, h, w] = x.dims();

        let tokens = x.clone().reshape([b, c, h * w]).swap_dims(1, 2);
        let query = self.norm.forward(tokens);
        let context = self.context_proj.forward(context);
        let attended = self
            .attention
            .forward(MhaInput::new(query, context.clone(), context))
            .context;

        x + attended.swap_dims(1, 2).reshape([b, c, h, w])
    }
}

/// Depth features added to the backbone at input and mid resolution
pub struct DepthFeatures<B: Backend> {
    pub input: Tensor<B, 4>,
    pub mid: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct DepthAdapter<B: Backend> {
    pub encode_in: Conv2d<B>,
    pub encode_out: Conv2d<B>,
    /// Depth slice of the first convolution
    pub fuse_in: Conv2d<B>,
    pub fuse_mid: Conv2d<B>,
}

impl<B: Backend> DepthAdapter<B> {
    /// `depth: [B, 1, h, w]`
    pub fn forward(&self, depth: Tensor<B, 4>) -> DepthFeatures<B> {
        let features = silu(self.encode_in.forward(depth));
        let features = silu(self.encode_out.forward(features));
        DepthFeatures {
            input: self.fuse_in.forward(features.clone()),
            mid: self.fuse_mid.forward(features),
        }
    }
}

/// Small two-level denoising U-Net over the latent
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    /// Kernel slice for `[noisy, masked, mask]`
    pub conv_in: Conv2d<B>,
    pub time_in: Linear<B>,
    pub time_out: Linear<B>,
    pub down_block: ResBlock<B>,
    pub downsample: Conv2d<B>,
    pub mid_block: ResBlock<B>,
    pub mid_attention: CrossAttention<B>,
    pub upsample: ConvTranspose2d<B>,
    pub up_block: ResBlock<B>,
    pub norm_out: GroupNorm<B>,
    pub conv_out: Conv2d<B>,
    time_embed_dim: usize,
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, input: DenoiseInput<B>, depth: Option<DepthFeatures<B>>) -> Tensor<B, 4> {
        let DenoiseInput {
            noisy_latent,
            timesteps,
            masked_latent,
            mask,
            context,
            ..
        } = input;

        let time = self.time_embedding(timesteps);

        let x = Tensor::cat(vec![noisy_latent, masked_latent, mask], 1);
        let mut x = self.conv_in.forward(x);
        let mut depth_mid = None;
        if let Some(depth) = depth {
            x = x + depth.input;
            depth_mid = Some(depth.mid);
        }

        let skip = self.down_block.forward(x, time.clone());
        let mut x = self.downsample.forward(skip.clone());
        if let Some(mid) = depth_mid {
            x = x + mid;
        }

        let x = self.mid_block.forward(x, time.clone());
        let x = self.mid_attention.forward(x, context);

        let x = self.upsample.forward(x) + skip;
        let x = self.up_block.forward(x, time);

        self.conv_out.forward(silu(self.norm_out.forward(x)))
    }

    /// Sinusoidal timestep embedding followed by a two-layer MLP: `[B] -> [B, C]`
    fn time_embedding(&self, timesteps: Tensor<B, 1>) -> Tensor<B, 2> {
        let device = timesteps.device();
        let half = self.time_embed_dim / 2;
        let frequencies: Vec<f32> = (0..half)
            .map(|i| (-(10_000f32.ln()) * i as f32 / half as f32).exp())
            .collect();
        let frequencies = Tensor::<B, 1>::from_floats(frequencies.as_slice(), &device).unsqueeze::<2>();

        let args = timesteps.unsqueeze_dim::<2>(1) * frequencies;
        let embedding = Tensor::cat(vec![args.clone().sin(), args.cos()], 1);

        let embedding = silu(self.time_in.forward(embedding));
        self.time_out.forward(embedding)
    }
}

/// One denoising query
#[derive(Clone, Debug)]
pub struct DenoiseInput<B: Backend> {
    pub noisy_latent: Tensor<B, 4>,
    /// Float timesteps, one per batch item
    pub timesteps: Tensor<B, 1>,
    pub masked_latent: Tensor<B, 4>,
    pub mask: Tensor<B, 4>,
    pub depth: Tensor<B, 4>,
    /// Semantic conditioning tokens `[B, T, context_dim]`
    pub context: Option<Tensor<B, 3>>,
}

/// Backbone plus depth adapter; predicts the noise in `noisy_latent`.
#[derive(Module, Debug)]
pub struct InpaintModel<B: Backend> {
    pub backbone: Backbone<B>,
    pub adapter: DepthAdapter<B>,
}

impl<B: Backend> InpaintModel<B> {
    pub fn new(backbone: Backbone<B>, adapter: DepthAdapter<B>) -> Self {
        Self { backbone, adapter }
    }

    /// Resolve `mode` into gradient tracking: a frozen backbone stops
    /// requiring gradients, so the optimizer never sees it.
    pub fn with_mode(self, mode: TrainingMode) -> Self {
        match mode {
            TrainingMode::Frozen => Self {
                backbone: self.backbone.no_grad(),
                adapter: self.adapter,
            },
            TrainingMode::Trainable => self,
        }
    }

    pub fn trainable_param_count(&self, mode: TrainingMode) -> usize {
        match mode {
            TrainingMode::Frozen => self.adapter.num_params(),
            TrainingMode::Trainable => self.num_params(),
        }
    }

    pub fn forward(&self, input: DenoiseInput<B>) -> Tensor<B, 4> {
        let depth = self.adapter.forward(input.depth.clone());
        self.backbone.forward(input, Some(depth))
    }
}
