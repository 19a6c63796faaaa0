use crate::kernels::{covered_records, grid_extent, invocation_at};
use crate::ComputeError;

/// What one invocation of the probe kernel records, as eight `i32`s.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InvocationRecord {
    pub global: [i32; 2],
    pub group: [i32; 2],
    pub local: [i32; 2],
    pub num_groups: [i32; 2],
}

#[allow(clippy::cast_possible_wrap)]
fn xy(v: [u32; 3]) -> [i32; 2] {
    [v[0] as i32, v[1] as i32]
}

pub fn handle_invocation_probe(groups: [u32; 3], out: &mut [u32]) -> Result<(), ComputeError> {
    let whole = out.len() / 8 * 8;
    let records: &mut [InvocationRecord] = bytemuck::cast_slice_mut(&mut out[..whole]);

    let (width, _) = grid_extent(groups);
    let count = covered_records(groups, records.len());
    for (offset, record) in records.iter_mut().enumerate().take(count) {
        let Some(inv) = invocation_at(offset as u64, width) else {
            break;
        };
        *record = InvocationRecord {
            global: xy(inv.global),
            group: xy(inv.group),
            local: xy(inv.local),
            num_groups: xy(groups),
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_identify_their_invocation() {
        let mut out = vec![0u32; 256 * 8];
        handle_invocation_probe([2, 2, 1], &mut out).unwrap();
        let records: &[InvocationRecord] = bytemuck::cast_slice(&out);

        // Row 9, column 10 of the 16x16 grid.
        let r = records[9 * 16 + 10];
        assert_eq!(r.global, [10, 9]);
        assert_eq!(r.group, [1, 1]);
        assert_eq!(r.local, [2, 1]);
        assert_eq!(r.num_groups, [2, 2]);
    }

    #[test]
    fn records_past_capacity_are_dropped() {
        let mut out = vec![0u32; 256 * 8];
        handle_invocation_probe([4, 4, 1], &mut out).unwrap();
        let records: &[InvocationRecord] = bytemuck::cast_slice(&out);
        // 32-wide grid: offset 255 is row 7, column 31.
        assert_eq!(records[255].global, [31, 7]);
    }

    #[test]
    fn huge_grid_writes_the_first_row_only() {
        let mut out = vec![0u32; 4 * 8];
        handle_invocation_probe([65_535, 65_535, 4], &mut out).unwrap();
        let records: &[InvocationRecord] = bytemuck::cast_slice(&out);
        assert_eq!(records[3].global, [3, 0]);
        assert_eq!(records[3].num_groups, [65_535, 65_535]);
    }
}
