use serde::{Deserialize, Serialize};

/// Row-major boolean pixel mask. `true` marks a pixel to synthesize.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<bool>,
}

impl Mask {
    /// Create an all-false mask
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![false; (width * height) as usize],
        }
    }

    /// Wrap existing row-major data. Returns `None` when the length is wrong.
    pub fn from_vec(width: u32, height: u32, data: Vec<bool>) -> Option<Self> {
        if data.len() != (width * height) as usize {
            return None;
        }
        Some(Self { width, height, data })
    }

    /// Build a mask from a per-pixel predicate
    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> bool) -> Self {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { width, height, data }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.data[(y * self.width + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        self.data[(y * self.width + x) as usize] = value;
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.data
    }

    /// Number of `true` pixels
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|&v| v)
    }

    /// Pixel-wise union. `None` when the dimensions differ.
    pub fn union(&self, other: &Mask) -> Option<Mask> {
        if self.dimensions() != other.dimensions() {
            return None;
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| a || b)
            .collect();
        Some(Mask {
            width: self.width,
            height: self.height,
            data,
        })
    }

    /// Downsample by `factor`; a cell is set when any covered pixel is set.
    pub fn downsample_any(&self, factor: u32) -> Mask {
        let factor = factor.max(1);
        let width = self.width / factor;
        let height = self.height / factor;
        Mask::from_fn(width, height, |cx, cy| {
            (0..factor).any(|dy| (0..factor).any(|dx| self.get(cx * factor + dx, cy * factor + dy)))
        })
    }

    /// Mask as `0.0` / `1.0` floats
    pub fn to_f32(&self) -> Vec<f32> {
        self.data.iter().map(|&v| if v { 1.0 } else { 0.0 }).collect()
    }
}
