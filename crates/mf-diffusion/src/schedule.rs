use burn::config::Config;
use burn::tensor::{backend::Backend, Device, Tensor};
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

/// Linear DDPM variance schedule
#[derive(Config, Debug)]
pub struct NoiseScheduleConfig {
    #[config(default = 1000)]
    pub num_train_timesteps: usize,

    #[config(default = "1e-4")]
    pub beta_start: f64,

    #[config(default = "2e-2")]
    pub beta_end: f64,
}

impl NoiseScheduleConfig {
    pub fn init(&self) -> NoiseSchedule {
        let n = self.num_train_timesteps.max(1);
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut product = 1.0;
        for i in 0..n {
            let beta = if n == 1 {
                self.beta_start
            } else {
                self.beta_start + (self.beta_end - self.beta_start) * i as f64 / (n - 1) as f64
            };
            product *= 1.0 - beta;
            alphas_cumprod.push(product);
        }
        NoiseSchedule { alphas_cumprod }
    }
}

#[derive(Clone, Debug)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// Cumulative signal retention at `t`; `None` means the clean sample.
    pub fn alpha_bar(&self, t: Option<usize>) -> f64 {
        match t {
            Some(t) => self.alphas_cumprod[t.min(self.alphas_cumprod.len() - 1)],
            None => 1.0,
        }
    }

    /// `sqrt(ab_t) * x0 + sqrt(1 - ab_t) * noise`, with `t` per batch item
    pub fn add_noise<B: Backend>(
        &self,
        x0: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Tensor<B, 4> {
        let device = x0.device();
        let batch = timesteps.len();
        let signal: Vec<f32> = timesteps
            .iter()
            .map(|&t| self.alpha_bar(Some(t)).sqrt() as f32)
            .collect();
        let sigma: Vec<f32> = timesteps
            .iter()
            .map(|&t| (1.0 - self.alpha_bar(Some(t))).sqrt() as f32)
            .collect();

        let signal = Tensor::<B, 1>::from_floats(signal.as_slice(), &device).reshape([batch, 1, 1, 1]);
        let sigma = Tensor::<B, 1>::from_floats(sigma.as_slice(), &device).reshape([batch, 1, 1, 1]);

        x0 * signal + noise * sigma
    }

    /// `num_steps` descending timesteps with trailing spacing; the first one
    /// is always the noisiest training timestep.
    pub fn sampling_timesteps(&self, num_steps: usize) -> Vec<usize> {
        let total = self.num_train_timesteps();
        if num_steps == 0 {
            return Vec::new();
        }
        let ratio = total as f64 / num_steps.min(total) as f64;
        (0..num_steps.min(total))
            .map(|i| ((total as f64 - i as f64 * ratio).round() as usize).saturating_sub(1))
            .collect()
    }

    /// One DDIM update from `ab_t` to `ab_prev`.
    ///
    /// `eta = 0` is deterministic; `eta = 1` matches ancestral DDPM variance.
    /// `noise` is only read when the step is stochastic.
    pub fn ddim_step<B: Backend>(
        &self,
        latent: Tensor<B, 4>,
        predicted_noise: Tensor<B, 4>,
        ab_t: f64,
        ab_prev: f64,
        eta: f64,
        noise: impl FnOnce() -> Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let x0 = (latent - predicted_noise.clone().mul_scalar((1.0 - ab_t).sqrt()))
            .div_scalar(ab_t.sqrt())
            .clamp(-1.0, 1.0);

        let sigma = eta * ((1.0 - ab_prev) / (1.0 - ab_t)).max(0.0).sqrt() * (1.0 - ab_t / ab_prev).max(0.0).sqrt();
        let direction = (1.0 - ab_prev - sigma * sigma).max(0.0).sqrt();

        let next = x0.mul_scalar(ab_prev.sqrt()) + predicted_noise.mul_scalar(direction);
        if sigma > 0.0 {
            next + noise().mul_scalar(sigma)
        } else {
            next
        }
    }
}

/// Standard normal tensor drawn from a seeded host generator
pub fn gaussian_noise<B: Backend>(rng: &mut StdRng, shape: [usize; 4], device: &Device<B>) -> Tensor<B, 4> {
    let len = shape.iter().product();
    let values: Vec<f32> = (0..len).map(|_| StandardNormal.sample(rng)).collect();
    Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape(shape)
}
