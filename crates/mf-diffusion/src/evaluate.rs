use std::collections::BTreeMap;

use image::Rgb32FImage;

use mf_core::error::{InferenceError, Result};
use mf_core::mask::Mask;

pub type Metrics = BTreeMap<String, f64>;

const SSIM_C1: f64 = 0.01 * 0.01;
const SSIM_C2: f64 = 0.03 * 0.03;

/// Reconstruction quality inside `mask`: `mse`, `mae`, `psnr` (peak 1.0) and
/// global `ssim` averaged over channels. An empty mask gives an empty map.
pub fn evaluate(predicted: &Rgb32FImage, ground_truth: &Rgb32FImage, mask: &Mask) -> Result<Metrics> {
    if predicted.dimensions() != ground_truth.dimensions() || predicted.dimensions() != mask.dimensions() {
        return Err(InferenceError::ShapeMismatch(format!(
            "predicted {:?}, ground truth {:?}, mask {:?}",
            predicted.dimensions(),
            ground_truth.dimensions(),
            mask.dimensions()
        ))
        .into());
    }

    let pairs: Vec<([f32; 3], [f32; 3])> = predicted
        .enumerate_pixels()
        .filter(|(x, y, _)| mask.get(*x, *y))
        .map(|(x, y, p)| (p.0, ground_truth.get_pixel(x, y).0))
        .collect();
    if pairs.is_empty() {
        return Ok(Metrics::new());
    }

    let n = (pairs.len() * 3) as f64;
    let (mut squared, mut absolute) = (0.0, 0.0);
    for (p, g) in &pairs {
        for c in 0..3 {
            let d = (p[c] - g[c]) as f64;
            squared += d * d;
            absolute += d.abs();
        }
    }
    let mse = squared / n;
    let psnr = if mse > 0.0 { 10.0 * (1.0 / mse).log10() } else { f64::INFINITY };
    let ssim = (0..3).map(|c| channel_ssim(&pairs, c)).sum::<f64>() / 3.0;

    let mut metrics = Metrics::new();
    metrics.insert("mse".into(), mse);
    metrics.insert("mae".into(), absolute / n);
    metrics.insert("psnr".into(), psnr);
    metrics.insert("ssim".into(), ssim);
    Ok(metrics)
}

fn channel_ssim(pairs: &[([f32; 3], [f32; 3])], c: usize) -> f64 {
    let n = pairs.len() as f64;
    let mean_p = pairs.iter().map(|(p, _)| p[c] as f64).sum::<f64>() / n;
    let mean_g = pairs.iter().map(|(_, g)| g[c] as f64).sum::<f64>() / n;

    let (mut var_p, mut var_g, mut cov) = (0.0, 0.0, 0.0);
    for (p, g) in pairs {
        let dp = p[c] as f64 - mean_p;
        let dg = g[c] as f64 - mean_g;
        var_p += dp * dp;
        var_g += dg * dg;
        cov += dp * dg;
    }
    let (var_p, var_g, cov) = (var_p / n, var_g / n, cov / n);

    ((2.0 * mean_p * mean_g + SSIM_C1) * (2.0 * cov + SSIM_C2))
        / ((mean_p * mean_p + mean_g * mean_g + SSIM_C1) * (var_p + var_g + SSIM_C2))
}

/// Running mean of metric maps. Infinite values (a perfect PSNR) are counted
/// separately so they do not swamp the mean.
#[derive(Clone, Debug, Default)]
pub struct MetricsAccumulator {
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, usize>,
    infinite: BTreeMap<String, usize>,
    samples: usize,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, metrics: &Metrics) {
        if metrics.is_empty() {
            return;
        }
        self.samples += 1;
        for (name, value) in metrics {
            if value.is_finite() {
                *self.sums.entry(name.clone()).or_default() += value;
                *self.counts.entry(name.clone()).or_default() += 1;
            } else {
                *self.infinite.entry(name.clone()).or_default() += 1;
            }
        }
    }

    /// Samples that contributed a non-empty map
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn mean(&self) -> Metrics {
        let mut mean: Metrics = self
            .sums
            .iter()
            .map(|(name, sum)| (name.clone(), sum / self.counts[name] as f64))
            .collect();
        for name in self.infinite.keys() {
            mean.entry(name.clone()).or_insert(f64::INFINITY);
        }
        mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn square_mask() -> Mask {
        Mask::from_fn(8, 8, |x, y| x < 4 && y < 4)
    }

    #[test]
    fn test_identical_images() {
        let image = Rgb32FImage::from_fn(8, 8, |x, y| Rgb([x as f32 / 8.0, y as f32 / 8.0, 0.3]));

        let metrics = evaluate(&image, &image, &square_mask()).unwrap();
        assert_eq!(metrics["mse"], 0.0);
        assert_eq!(metrics["mae"], 0.0);
        assert!(metrics["psnr"].is_infinite());
        assert!((metrics["ssim"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_only_masked_pixels_count() {
        let truth = Rgb32FImage::from_pixel(8, 8, Rgb([0.5, 0.5, 0.5]));
        let mut predicted = truth.clone();
        // errors outside the mask are ignored
        predicted.put_pixel(7, 7, Rgb([0.0, 0.0, 0.0]));
        // inside: one pixel off by 0.4 on every channel
        predicted.put_pixel(0, 0, Rgb([0.9, 0.9, 0.9]));

        let metrics = evaluate(&predicted, &truth, &square_mask()).unwrap();
        assert!((metrics["mae"] - 0.4 / 16.0).abs() < 1e-6);
        assert!((metrics["mse"] - 0.16 / 16.0).abs() < 1e-6);
        assert!((metrics["psnr"] - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_empty_mask() {
        let image = Rgb32FImage::new(8, 8);
        assert!(evaluate(&image, &image, &Mask::new(8, 8)).unwrap().is_empty());
        assert!(evaluate(&image, &image, &Mask::new(4, 4)).is_err());
    }

    #[test]
    fn test_accumulator_mean() {
        let mut acc = MetricsAccumulator::new();
        acc.add(&Metrics::from([("mse".to_string(), 1.0), ("psnr".to_string(), f64::INFINITY)]));
        acc.add(&Metrics::from([("mse".to_string(), 3.0), ("psnr".to_string(), 10.0)]));
        acc.add(&Metrics::new());

        let mean = acc.mean();
        assert_eq!(acc.samples(), 2);
        assert_eq!(mean["mse"], 2.0);
        assert_eq!(mean["psnr"], 10.0);
    }
}
