use crate::backend::UniformValue;
use crate::kernels::for_each_invocation;
use crate::layout::{groups_for, CONV_WEIGHTS_PER_CHANNEL, LOCAL_SIZE};
use crate::ComputeError;

/// Grouped 3x3 convolution: invocation `(x, y, c)` writes output pixel
/// `(x, y)` of channel `c` from input channel `c` and kernel `c`.
///
/// Uniforms are `width`, `height`, `channels` in that order. Invocations
/// outside the image or past the last channel do nothing.
pub fn handle_group_conv3x3(
    groups: [u32; 3],
    uniforms: &[UniformValue],
    input: &[u32],
    weights: &[u32],
    out: &mut [u32],
) -> Result<(), ComputeError> {
    let [w, h, c] = match uniforms {
        [w, h, c] => [w.as_u32(), h.as_u32(), c.as_u32()],
        _ => {
            return Err(ComputeError::ShapeMismatch(
                "GroupConv3x3 expects width, height and channels uniforms",
            ))
        }
    };
    let (width, height, channels) = (w as usize, h as usize, c as usize);
    let too_large = || ComputeError::ShapeMismatch("GroupConv3x3 image extent overflows");
    let plane = width.checked_mul(height).ok_or_else(too_large)?;
    let total = plane.checked_mul(channels).ok_or_else(too_large)?;
    if input.len() < total || out.len() < total {
        return Err(ComputeError::ShapeMismatch(
            "GroupConv3x3 planes are smaller than channels * width * height",
        ));
    }
    let weight_len = channels
        .checked_mul(CONV_WEIGHTS_PER_CHANNEL)
        .ok_or_else(too_large)?;
    if weights.len() < weight_len {
        return Err(ComputeError::ShapeMismatch(
            "GroupConv3x3 weight buffer is smaller than channels * 10",
        ));
    }

    let input: &[f32] = bytemuck::cast_slice(input);
    let weights: &[f32] = bytemuck::cast_slice(weights);
    let out: &mut [f32] = bytemuck::cast_slice_mut(out);

    // Groups past the image and the last channel write nothing; skip them.
    let covered = [
        groups[0].min(groups_for(w, LOCAL_SIZE[0])),
        groups[1].min(groups_for(h, LOCAL_SIZE[1])),
        groups[2].min(groups_for(c, LOCAL_SIZE[2])),
    ];
    for_each_invocation(covered, |inv| {
        let (x, y, c) = (
            inv.global[0] as usize,
            inv.global[1] as usize,
            inv.global[2] as usize,
        );
        if x >= width || y >= height || c >= channels {
            return;
        }
        let src = &input[c * plane..(c + 1) * plane];
        let k = &weights[c * CONV_WEIGHTS_PER_CHANNEL..(c + 1) * CONV_WEIGHTS_PER_CHANNEL];
        let mut acc = 0.0f32;
        for ky in 0..3 {
            for kx in 0..3 {
                let (sx, sy) = ((x + kx).checked_sub(1), (y + ky).checked_sub(1));
                let value = match (sx, sy) {
                    (Some(sx), Some(sy)) if sx < width && sy < height => src[sy * width + sx],
                    _ => 0.0,
                };
                acc += k[ky * 3 + kx] * value;
            }
        }
        out[c * plane + y * width + x] = (acc + k[9]).tanh();
    });
    Ok(())
}
