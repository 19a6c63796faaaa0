// CPU handlers for each kernel. A handler walks the full invocation grid of
// a dispatch, computing what each shader invocation would write.

pub mod group_conv_op;
pub use group_conv_op::handle_group_conv3x3;
pub mod invocation_probe_op;
pub use invocation_probe_op::{handle_invocation_probe, InvocationRecord};
pub mod point_circle_op;
pub use point_circle_op::{handle_point_circle, PointVertex};

use crate::layout::LOCAL_SIZE;

/// IDs a single shader invocation observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    pub global: [u32; 3],
    pub group: [u32; 3],
    pub local: [u32; 3],
}

/// Calls `f` once per invocation of a dispatch over `groups`, in
/// group-major order.
pub fn for_each_invocation(groups: [u32; 3], mut f: impl FnMut(Invocation)) {
    for gz in 0..groups[2] {
        for gy in 0..groups[1] {
            for gx in 0..groups[0] {
                for lz in 0..LOCAL_SIZE[2] {
                    for ly in 0..LOCAL_SIZE[1] {
                        for lx in 0..LOCAL_SIZE[0] {
                            f(Invocation {
                                global: [
                                    gx * LOCAL_SIZE[0] + lx,
                                    gy * LOCAL_SIZE[1] + ly,
                                    gz * LOCAL_SIZE[2] + lz,
                                ],
                                group: [gx, gy, gz],
                                local: [lx, ly, lz],
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Width and total size of the 2D grid a dispatch over `groups` covers,
/// flattened row by row. Saturates rather than wrapping.
pub(crate) fn grid_extent(groups: [u32; 3]) -> (u64, u64) {
    let width = u64::from(LOCAL_SIZE[0]) * u64::from(groups[0]);
    let height = u64::from(LOCAL_SIZE[1]) * u64::from(groups[1]);
    (width, width.saturating_mul(height))
}

/// The invocation of the first z layer sitting at `offset` in a row-major
/// grid `width` invocations wide.
pub(crate) fn invocation_at(offset: u64, width: u64) -> Option<Invocation> {
    if width == 0 {
        return None;
    }
    let x = u32::try_from(offset % width).ok()?;
    let y = u32::try_from(offset / width).ok()?;
    Some(Invocation {
        global: [x, y, 0],
        group: [x / LOCAL_SIZE[0], y / LOCAL_SIZE[1], 0],
        local: [x % LOCAL_SIZE[0], y % LOCAL_SIZE[1], 0],
    })
}

/// Number of leading records of a flattened 2D grid that fit in `capacity`.
/// Later z layers write the same records again, so only these need visiting.
pub(crate) fn covered_records(groups: [u32; 3], capacity: usize) -> usize {
    let (_, size) = grid_extent(groups);
    usize::try_from(size).map_or(capacity, |size| size.min(capacity))
}
