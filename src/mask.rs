//! Per-region spatial weight tensors for blending overlapping regions.

use std::f32::consts::PI;

use ndarray::{Array1, Array2, Array4, Axis};

use crate::region::{CanvasRegion, DiffusionRegion, MaskMode};

/// Normalized-coordinate variance of the Gaussian mask. The kernel narrows
/// as a fraction of region size, not at an absolute scale.
const GAUSSIAN_VAR: f32 = 0.01;

/// Leading constant of the quartic (biweight) kernel.
const QUARTIC_CONSTANT: f32 = 15.0 / 16.0;

/// Support width for the quartic kernel. 1.99 instead of 2.0 keeps the
/// endpoints at u = +-0.995, where the kernel is still positive.
const QUARTIC_SUPPORT: f32 = 1.99;

/// Computes a tensor of weights for a given diffusion region.
///
/// The weight pattern is spatial-only: the same 2-D pattern is tiled
/// across the batch and channel dimensions.
#[derive(Debug, Clone, Copy)]
pub struct MaskWeightsBuilder {
    /// Number of channels in the denoiser's latent space.
    pub latent_channels: usize,
    /// Batch size in the denoiser.
    pub batch_size: usize,
}

impl MaskWeightsBuilder {
    /// Create a builder for the given latent channel count and batch size.
    #[must_use]
    pub const fn new(latent_channels: usize, batch_size: usize) -> Self {
        Self {
            latent_channels,
            batch_size,
        }
    }

    /// Compute the weight tensor for a region, shaped
    /// `(batch, channels, latent_height, latent_width)`.
    #[must_use]
    pub fn compute_mask_weights(&self, region: &DiffusionRegion) -> Array4<f32> {
        self.compute(region.canvas(), region.mask_mode(), region.mask_weight())
    }

    /// Compute the weight tensor for an explicit rectangle, mask mode and
    /// weight.
    #[must_use]
    pub fn compute(&self, canvas: &CanvasRegion, mode: MaskMode, weight: f32) -> Array4<f32> {
        let height = canvas.latent_height();
        let width = canvas.latent_width();

        let spatial = match mode {
            MaskMode::Constant => Array2::from_elem((height, width), weight),
            MaskMode::Gaussian => {
                outer(&gaussian_probs(height), &gaussian_probs(width)) * weight
            }
            MaskMode::Quartic => outer(&quartic_probs(height), &quartic_probs(width)) * weight,
        };

        self.tile(&spatial)
    }

    /// Tile a 2-D spatial pattern across the batch and channel axes.
    fn tile(&self, spatial: &Array2<f32>) -> Array4<f32> {
        let (height, width) = spatial.dim();
        spatial
            .view()
            .insert_axis(Axis(0))
            .insert_axis(Axis(0))
            .broadcast((self.batch_size, self.latent_channels, height, width))
            .expect("spatial pattern broadcasts over batch and channels")
            .to_owned()
    }
}

/// 1-D Gaussian over local coordinates, midpoint at `(extent - 1) / 2`.
#[allow(clippy::cast_precision_loss)]
fn gaussian_probs(extent: usize) -> Array1<f32> {
    let midpoint = (extent as f32 - 1.0) / 2.0;
    let extent_sq = (extent * extent) as f32;
    Array1::from_iter((0..extent).map(|x| {
        let d = x as f32 - midpoint;
        (-d * d / extent_sq / (2.0 * GAUSSIAN_VAR)).exp() / (2.0 * PI * GAUSSIAN_VAR).sqrt()
    }))
}

/// 1-D quartic (biweight) kernel over support `u in [-0.995, 0.995]`.
#[allow(clippy::cast_precision_loss)]
fn quartic_probs(extent: usize) -> Array1<f32> {
    Array1::from_iter((0..extent).map(|x| {
        let u = if extent > 1 {
            (x as f32) / (extent as f32 - 1.0) * QUARTIC_SUPPORT - QUARTIC_SUPPORT / 2.0
        } else {
            0.0
        };
        QUARTIC_CONSTANT * (1.0 - u * u) * (1.0 - u * u)
    }))
}

/// Outer product of two 1-D kernels.
fn outer(rows: &Array1<f32>, cols: &Array1<f32>) -> Array2<f32> {
    Array2::from_shape_fn((rows.len(), cols.len()), |(y, x)| rows[y] * cols[x])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{CanvasRegion, Text2ImageRegion};

    fn region(mode: MaskMode, weight: f32) -> DiffusionRegion {
        let canvas = CanvasRegion::new(0, 128, 0, 256).unwrap();
        DiffusionRegion::Text2Image(
            Text2ImageRegion::new(canvas, mode, weight, "test", 7.5).unwrap(),
        )
    }

    #[test]
    fn test_constant_weights_uniform() {
        let builder = MaskWeightsBuilder::new(4, 1);
        let weights = builder.compute_mask_weights(&region(MaskMode::Constant, 2.5));

        assert_eq!(weights.shape(), &[1, 4, 16, 32]);
        for &w in &weights {
            assert!((w - 2.5).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn test_weights_tiled_across_channels() {
        let builder = MaskWeightsBuilder::new(4, 2);
        let weights = builder.compute_mask_weights(&region(MaskMode::Gaussian, 1.0));

        assert_eq!(weights.shape(), &[2, 4, 16, 32]);
        for b in 0..2 {
            for c in 0..4 {
                for y in 0..16 {
                    for x in 0..32 {
                        assert_eq!(weights[[b, c, y, x]], weights[[0, 0, y, x]]);
                    }
                }
            }
        }
    }

    fn assert_symmetric_and_decreasing(kernel: &Array1<f32>) {
        let n = kernel.len();
        for i in 0..n {
            assert!((kernel[i] - kernel[n - 1 - i]).abs() < 1e-5, "not symmetric at {i}");
        }
        // Strictly decreasing outward from the center on each half
        for i in 0..(n - 1) / 2 {
            assert!(kernel[i] < kernel[i + 1], "not increasing toward center at {i}");
        }
    }

    #[test]
    fn test_gaussian_symmetric_monotonic() {
        assert_symmetric_and_decreasing(&gaussian_probs(16));
        assert_symmetric_and_decreasing(&gaussian_probs(17));
    }

    #[test]
    fn test_quartic_symmetric_monotonic() {
        assert_symmetric_and_decreasing(&quartic_probs(16));
        assert_symmetric_and_decreasing(&quartic_probs(17));
    }

    #[test]
    fn test_quartic_bounded_support_positive_at_edges() {
        let kernel = quartic_probs(16);
        // 1.99 support keeps the endpoints strictly positive
        assert!(kernel[0] > 0.0);
        assert!(kernel[15] > 0.0);
        // but decayed to near zero relative to the center
        let center = kernel[7].max(kernel[8]);
        assert!(kernel[0] < center * 0.01);
    }

    #[test]
    fn test_quartic_single_element_extent() {
        let kernel = quartic_probs(1);
        assert_eq!(kernel.len(), 1);
        assert!((kernel[0] - QUARTIC_CONSTANT).abs() < 1e-6);
        assert!(kernel[0].is_finite());
    }

    #[test]
    fn test_gaussian_scaled_by_mask_weight() {
        let builder = MaskWeightsBuilder::new(1, 1);
        let unit = builder.compute_mask_weights(&region(MaskMode::Gaussian, 1.0));
        let tripled = builder.compute_mask_weights(&region(MaskMode::Gaussian, 3.0));

        for (a, b) in unit.iter().zip(tripled.iter()) {
            assert!((a * 3.0 - b).abs() < 1e-5);
        }
    }
}
