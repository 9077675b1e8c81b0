//! Heatmap grid and resampling for overlay preparation

use candle_core::{Device, Tensor};
use serde::Serialize;

use crate::error::{GradCamError, Result};

/// Row-major 2-D grid of non-negative importance values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Heatmap {
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl Heatmap {
    /// Build from row-major data; `data.len()` must equal `height * width`.
    pub fn new(height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if height == 0 || width == 0 || data.len() != height * width {
            return Err(GradCamError::shape(format!(
                "heatmap {height}x{width} cannot hold {} values",
                data.len()
            )));
        }
        Ok(Self {
            height,
            width,
            data,
        })
    }

    /// Build from a 2-D tensor.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let (height, width) = tensor.dims2()?;
        let data: Vec<f32> = tensor
            .to_dtype(candle_core::DType::F32)?
            .flatten_all()?
            .to_vec1()?;
        Self::new(height, width, data)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row < self.height && col < self.width {
            self.data.get(row * self.width + col).copied()
        } else {
            None
        }
    }

    /// Iterate rows as slices
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks(self.width)
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn min(&self) -> f32 {
        self.data.iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// (row, col) of the first maximal cell
    pub fn peak(&self) -> (usize, usize) {
        let mut best = 0;
        for (i, &v) in self.data.iter().enumerate() {
            if v > self.data[best] {
                best = i;
            }
        }
        (best / self.width, best % self.width)
    }

    /// No positive evidence anywhere: every cell is zero.
    pub fn is_degenerate(&self) -> bool {
        self.data.iter().all(|&v| v == 0.0)
    }

    /// Copy into a `(height, width)` F32 tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.data.clone(),
            (self.height, self.width),
            device,
        )?)
    }

    /// Floor negatives at zero, then scale so the maximum is exactly 1.0.
    ///
    /// The threshold is relative: if the positive maximum is zero, subnormal,
    /// or at most `epsilon` times the largest magnitude before flooring, the
    /// grid carries no positive evidence and an all-zero map is returned
    /// instead of dividing. Values must be finite.
    pub(crate) fn rectify_and_normalize(mut self, epsilon: f32) -> Self {
        let scale = self.data.iter().fold(0f32, |m, v| m.max(v.abs()));
        for v in &mut self.data {
            *v = v.max(0.0);
        }
        let max = self.max();
        if max < f32::MIN_POSITIVE || max <= epsilon * scale {
            self.data.fill(0.0);
        } else {
            for v in &mut self.data {
                *v /= max;
            }
        }
        self
    }
}

/// Resample to `target_height × target_width` with bilinear interpolation.
///
/// Uses half-pixel centres with edge clamping (the OpenCV `INTER_LINEAR`
/// convention): every output is a convex combination of input cells, so
/// values stay within the input's `[min, max]`, and a same-size request
/// reproduces the input exactly.
pub fn upscale(heatmap: &Heatmap, target_height: usize, target_width: usize) -> Result<Heatmap> {
    if target_height == 0 || target_width == 0 {
        return Err(GradCamError::shape(format!(
            "cannot resample to {target_height}x{target_width}"
        )));
    }

    let rows = axis_samples(heatmap.height, target_height);
    let cols = axis_samples(heatmap.width, target_width);
    let mut data = Vec::with_capacity(target_height * target_width);
    for &(r0, r1, fy) in &rows {
        for &(c0, c1, fx) in &cols {
            let top = lerp(at(heatmap, r0, c0), at(heatmap, r0, c1), fx);
            let bottom = lerp(at(heatmap, r1, c0), at(heatmap, r1, c1), fx);
            data.push(lerp(top, bottom, fy));
        }
    }
    Heatmap::new(target_height, target_width, data)
}

fn at(heatmap: &Heatmap, row: usize, col: usize) -> f32 {
    heatmap.data[row * heatmap.width + col]
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    // Clamp absorbs rounding so the result never leaves [a, b].
    (a * (1.0 - t) + b * t).clamp(a.min(b), a.max(b))
}

/// For each output index: (lower source, upper source, fraction toward upper).
fn axis_samples(input: usize, output: usize) -> Vec<(usize, usize, f32)> {
    let scale = input as f64 / output as f64;
    let last = input - 1;
    (0..output)
        .map(|i| {
            let src = ((i as f64 + 0.5) * scale - 0.5).clamp(0.0, last as f64);
            let lo = src.floor() as usize;
            let hi = (lo + 1).min(last);
            (lo, hi, (src - lo as f64) as f32)
        })
        .collect()
}
