//! Reference CPU convolution.
//!
//! Pure functions with no device state; the GPU path is checked against
//! these.

use crate::layout::CONV_WEIGHTS_PER_CHANNEL;
use crate::ComputeError;

/// Nine taps (row-major, top-left first) and a bias.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelWeights {
    pub taps: [f32; 9],
    pub bias: f32,
}

impl KernelWeights {
    /// Reads one channel's weights: nine taps followed by the bias.
    pub fn from_slice(values: &[f32]) -> Result<Self, ComputeError> {
        if values.len() != CONV_WEIGHTS_PER_CHANNEL {
            return Err(ComputeError::ShapeMismatch(
                "a channel's weights are nine taps and one bias",
            ));
        }
        let mut taps = [0.0; 9];
        taps.copy_from_slice(&values[..9]);
        Ok(Self {
            taps,
            bias: values[9],
        })
    }
}

/// Splits a weight buffer into per-channel kernels.
pub fn split_channel_weights(
    weights: &[f32],
    channels: usize,
) -> Result<Vec<KernelWeights>, ComputeError> {
    if weights.len() != channels * CONV_WEIGHTS_PER_CHANNEL {
        return Err(ComputeError::ShapeMismatch(
            "weight buffer length is not channels * 10",
        ));
    }
    weights
        .chunks_exact(CONV_WEIGHTS_PER_CHANNEL)
        .map(KernelWeights::from_slice)
        .collect()
}

/// Channel count implied by a weight buffer of `len` floats.
pub fn channels_in(len: usize) -> Result<usize, ComputeError> {
    if len == 0 || len % CONV_WEIGHTS_PER_CHANNEL != 0 {
        return Err(ComputeError::ShapeMismatch(
            "weight buffer length is not a positive multiple of 10",
        ));
    }
    Ok(len / CONV_WEIGHTS_PER_CHANNEL)
}

/// Pixel at `(x, y)`, or exactly `0.0` outside the image.
#[must_use]
pub fn sample(image: &[f32], width: usize, height: usize, x: isize, y: isize) -> f32 {
    match (usize::try_from(x), usize::try_from(y)) {
        (Ok(x), Ok(y)) if x < width && y < height => image[y * width + x],
        _ => 0.0,
    }
}

/// `tanh(bias + sum(taps * neighbourhood))` at one pixel.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn stencil_at(
    image: &[f32],
    width: usize,
    height: usize,
    x: usize,
    y: usize,
    weights: &KernelWeights,
) -> f32 {
    let mut acc = 0.0f32;
    for dy in -1..=1isize {
        for dx in -1..=1isize {
            let tap = weights.taps[((dy + 1) * 3 + (dx + 1)) as usize];
            acc += tap * sample(image, width, height, x as isize + dx, y as isize + dy);
        }
    }
    (acc + weights.bias).tanh()
}

/// 3x3 convolution with zero padding, followed by `tanh`.
pub fn convolve(
    image: &[f32],
    width: usize,
    height: usize,
    kernel: &[f32; 9],
    bias: f32,
) -> Result<Vec<f32>, ComputeError> {
    if image.len() != width * height {
        return Err(ComputeError::ShapeMismatch(
            "image length does not match width * height",
        ));
    }
    let weights = KernelWeights { taps: *kernel, bias };
    let mut out = Vec::with_capacity(image.len());
    for y in 0..height {
        for x in 0..width {
            out.push(stencil_at(image, width, height, x, y, &weights));
        }
    }
    Ok(out)
}

/// Applies one kernel per channel to `planes` (channel-major, each plane
/// `width * height`).
pub fn convolve_channels(
    planes: &[f32],
    width: usize,
    height: usize,
    weights: &[f32],
) -> Result<Vec<f32>, ComputeError> {
    let channels = channels_in(weights.len())?;
    let plane_len = width * height;
    if planes.len() != plane_len * channels {
        return Err(ComputeError::ShapeMismatch(
            "input planes do not match channels * width * height",
        ));
    }
    let kernels = split_channel_weights(weights, channels)?;
    let mut out = Vec::with_capacity(planes.len());
    for (plane, k) in planes.chunks_exact(plane_len.max(1)).zip(&kernels) {
        out.extend(convolve(plane, width, height, &k.taps, k.bias)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const IDENTITY: [f32; 9] = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0];

    #[test]
    fn identity_kernel_is_elementwise_tanh() {
        let image: Vec<f32> = (0..25).map(|i| i as f32 * 0.1 - 1.2).collect();
        let out = convolve(&image, 5, 5, &IDENTITY, 0.0).unwrap();
        for (got, x) in out.iter().zip(&image) {
            assert_eq!(*got, x.tanh());
        }
    }

    #[test]
    fn border_pixels_see_zero_padding() {
        let image = vec![1.0f32; 9];
        let ones = [1.0f32; 9];
        let out = convolve(&image, 3, 3, &ones, 0.0).unwrap();
        assert_eq!(out[0], 4.0f32.tanh());
        assert_eq!(out[1], 6.0f32.tanh());
        assert_eq!(out[4], 9.0f32.tanh());
        assert_eq!(out[8], 4.0f32.tanh());
    }

    #[test]
    fn all_zero_image_and_kernel() {
        let (w, h) = (160, 240);
        let out = convolve(&vec![0.0; w * h], w, h, &[0.0; 9], 0.0).unwrap();
        assert_eq!(out.len(), w * h);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        assert!(convolve(&[0.0; 5], 2, 2, &IDENTITY, 0.0).is_err());
        assert!(channels_in(15).is_err());
        assert!(channels_in(0).is_err());
        assert_eq!(channels_in(40).unwrap(), 4);
    }

    #[test]
    fn channels_use_their_own_kernel() {
        let plane = vec![0.5f32; 4];
        let planes = [plane.clone(), plane].concat();
        let mut weights = vec![0.0f32; 20];
        weights[4] = 1.0; // channel 0: identity
        weights[19] = 2.0; // channel 1: bias only
        let out = convolve_channels(&planes, 2, 2, &weights).unwrap();
        assert!(out[..4].iter().all(|&v| v == 0.5f32.tanh()));
        assert!(out[4..].iter().all(|&v| v == 2.0f32.tanh()));
    }

    proptest! {
        #[test]
        fn out_of_bounds_samples_are_zero(
            w in 1usize..8,
            h in 1usize..8,
            x in -4isize..12,
            y in -4isize..12,
        ) {
            let image = vec![3.0f32; w * h];
            let inside = x >= 0 && y >= 0 && (x as usize) < w && (y as usize) < h;
            let expected = if inside { 3.0 } else { 0.0 };
            prop_assert_eq!(sample(&image, w, h, x, y), expected);
        }

        #[test]
        fn corner_matches_manual_padding(
            taps in proptest::array::uniform9(-1.0f32..1.0),
            bias in -1.0f32..1.0,
            image in proptest::collection::vec(-1.0f32..1.0, 16),
        ) {
            let out = convolve(&image, 4, 4, &taps, bias).unwrap();
            // Top-left pixel only sees taps 4, 5, 7, 8.
            let manual = (taps[4] * image[0] + taps[5] * image[1]
                + taps[7] * image[4] + taps[8] * image[5] + bias).tanh();
            prop_assert!((out[0] - manual).abs() < 1e-6);
        }
    }
}
