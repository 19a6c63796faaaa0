use crate::backend::UniformValue;
use crate::kernels::{covered_records, grid_extent, invocation_at};
use crate::ComputeError;

/// One point of the circle: position then colour, 32 bytes, matching the
/// interleaved `vec4`/`vec4` layout of the shader's storage block.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PointVertex {
    pub position: [f32; 4],
    pub color: [f32; 4],
}

/// Evaluates the circle kernel for every invocation of `groups`.
///
/// Invocations whose linear offset falls past the end of `out` write
/// nothing, the same as a bounds-checked runtime-sized array in the shader,
/// so only the records that fit are visited.
pub fn handle_point_circle(
    groups: [u32; 3],
    uniforms: &[UniformValue],
    out: &mut [u32],
) -> Result<(), ComputeError> {
    let radius = uniforms
        .first()
        .ok_or(ComputeError::ShapeMismatch("PointCircle expects a radius uniform"))?
        .as_f32();

    let whole = out.len() / (std::mem::size_of::<PointVertex>() / 4) * 8;
    let points: &mut [PointVertex] = bytemuck::cast_slice_mut(&mut out[..whole]);

    let (width, size) = grid_extent(groups);
    let count = covered_records(groups, points.len());
    for (offset, point) in points.iter_mut().enumerate().take(count) {
        let Some(inv) = invocation_at(offset as u64, width) else {
            break;
        };
        #[allow(clippy::cast_precision_loss)]
        let alpha = 2.0 * std::f32::consts::PI * (offset as f32 / size as f32);
        #[allow(clippy::cast_precision_loss)]
        let shade = inv.global[0] as f32 / width as f32;
        *point = PointVertex {
            position: [alpha.sin() * radius, alpha.cos() * radius, 0.0, 1.0],
            color: [shade, 0.0, 1.0, 1.0],
        };
    }
    Ok(())
}
