//! Vertex-count padding and invocation packing.
use crate::Error;
use bytemuck::{Pod, Zeroable};

/// Thread group split used for graphics jobs.
pub const SPLIT_MIN_EFFICIENT: u32 = 2;

/// Returns the vertex count the hardware uses to lay out per-vertex data of instanced draws.
///
/// Counts below 20 are used as-is (rounded up to an even number from 10 on). Larger counts are
/// rounded up to the next value of the form `m * 2^k` with `m` in {1, 3, 5, 7, 9}, which is
/// what the instancing hardware can divide by.
///
/// Returns `None` when the padded count does not fit in 32 bits.
pub fn padded_vertex_count(vertex_count: u32) -> Option<u32> {
    if vertex_count < 10 {
        return Some(vertex_count);
    }
    if vertex_count < 20 {
        return Some((vertex_count + 1) & !1);
    }

    let highest = 32 - vertex_count.leading_zeros();
    let n = highest - 4;
    let nibble = (vertex_count >> n) & 0xf;
    let middle_two = (nibble >> 1) & 0x3;

    let (odd, shift) = match middle_two {
        0b00 if nibble & 1 == 0 => (9u64, n),
        0b00 => (5, n + 1),
        0b01 => (3, n + 2),
        0b10 => (7, n + 1),
        _ => (1, n + 4),
    };
    u32::try_from(odd << shift).ok()
}

fn log2_ceil(v: u32) -> u32 {
    if v <= 1 {
        0
    } else {
        32 - (v - 1).leading_zeros()
    }
}

/// Packed workgroup size and count.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Invocation {
    /// `value - 1` for each of the six dimensions, at the shifts stored in `shifts`.
    pub invocations: u32,
    /// size-y shift in bits 0..5, size-z 5..10, count-x 10..16, count-y 16..22,
    /// count-z 22..28, thread group split 28..32.
    pub shifts: u32,
}

impl Invocation {
    /// Packs a workgroup count (`num`) and a workgroup size (`size`). All values must be >= 1.
    ///
    /// Graphics jobs (`graphics = true`) use unit workgroups, with the vertex count in `num[1]`
    /// and the instance count in `num[2]`.
    ///
    /// The six values share one 32-bit word, each taking `log2_ceil(value)` bits. Larger
    /// combinations cannot be encoded and are rejected with `InvalidUsage`.
    pub fn pack(
        num: [u32; 3],
        size: [u32; 3],
        graphics: bool,
        indirect: bool,
    ) -> Result<Invocation, Error> {
        let values = [size[0], size[1], size[2], num[0], num[1], num[2]];
        let mut shifts = [0u32; 7];
        let mut packed = 0u64;

        for (i, &v) in values.iter().enumerate() {
            debug_assert!(v >= 1);
            let end = shifts[i] + log2_ceil(v);
            if end > 32 {
                return Err(Error::invalid_usage(format!(
                    "workgroup count {:?} with size {:?} does not fit in an invocation word",
                    num, size
                )));
            }
            packed |= (v.saturating_sub(1) as u64) << shifts[i];
            shifts[i + 1] = end;
        }

        let workgroups_x_shift = shifts[3];
        let (mut workgroups_y_shift, mut workgroups_z_shift) = (shifts[4], shifts[5]);
        if indirect {
            // filled in by the indirect dispatch job
            workgroups_y_shift = 0;
            workgroups_z_shift = 0;
        }
        if graphics && num[2] <= 1 {
            workgroups_z_shift = 32;
        }
        let split = if graphics {
            SPLIT_MIN_EFFICIENT
        } else {
            workgroups_x_shift
        };

        Ok(Invocation {
            invocations: packed as u32,
            shifts: shifts[1]
                | shifts[2] << 5
                | workgroups_x_shift << 10
                | workgroups_y_shift << 16
                | (workgroups_z_shift & 0x3f) << 22
                | (split & 0xf) << 28,
        })
    }

    pub fn size_y_shift(&self) -> u32 {
        self.shifts & 0x1f
    }

    pub fn workgroups_x_shift(&self) -> u32 {
        (self.shifts >> 10) & 0x3f
    }

    pub fn workgroups_z_shift(&self) -> u32 {
        (self.shifts >> 22) & 0x3f
    }

    pub fn thread_group_split(&self) -> u32 {
        self.shifts >> 28
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_counts_are_kept_or_rounded_to_even() {
        assert_eq!(padded_vertex_count(0), Some(0));
        assert_eq!(padded_vertex_count(3), Some(3));
        assert_eq!(padded_vertex_count(9), Some(9));
        assert_eq!(padded_vertex_count(11), Some(12));
        assert_eq!(padded_vertex_count(19), Some(20));
    }

    #[test]
    fn large_counts_are_padded_to_divisible_forms() {
        assert_eq!(padded_vertex_count(20), Some(24));
        assert_eq!(padded_vertex_count(32), Some(36));
        assert_eq!(padded_vertex_count(33), Some(36));
        assert_eq!(padded_vertex_count(100), Some(112));
        for n in 20..5000 {
            let p = padded_vertex_count(n).unwrap();
            assert!(p >= n, "{} padded to {}", n, p);
            let odd = p >> p.trailing_zeros();
            assert!([1, 3, 5, 7, 9].contains(&odd), "{} padded to {}", n, p);
        }
    }

    #[test]
    fn graphics_invocation() {
        // 3 vertices, 1 instance
        let inv = Invocation::pack([1, 3, 1], [1, 1, 1], true, false).unwrap();
        assert_eq!(inv.invocations, 2);
        assert_eq!(inv.size_y_shift(), 0);
        assert_eq!(inv.workgroups_z_shift(), 32);
        assert_eq!(inv.thread_group_split(), SPLIT_MIN_EFFICIENT);
    }

    #[test]
    fn counts_near_the_top_of_the_range() {
        assert_eq!(padded_vertex_count(0x8000_0000), Some(0x9000_0000));
        assert_eq!(padded_vertex_count(0xe000_0001), None);
        assert_eq!(padded_vertex_count(0xf000_0000), None);
        assert_eq!(padded_vertex_count(u32::MAX), None);
    }

    #[test]
    fn compute_invocation_split_matches_workgroup_x_shift() {
        let inv = Invocation::pack([4, 2, 1], [8, 8, 1], false, false).unwrap();
        // size 8x8x1 uses 3 + 3 + 0 bits
        assert_eq!(inv.workgroups_x_shift(), 6);
        assert_eq!(inv.thread_group_split(), 6);
        assert_eq!(inv.invocations, 7 | 7 << 3 | 3 << 6 | 1 << 8);
    }

    #[test]
    fn oversized_invocations_are_rejected() {
        // 3 + 3 + 0 + 16 + 16 bits
        assert!(matches!(
            Invocation::pack([65535, 65535, 1], [8, 8, 1], false, false),
            Err(Error::InvalidUsage(_))
        ));
        assert!(Invocation::pack([1, u32::MAX, 2], [1, 1, 1], true, false).is_err());

        // exactly 32 bits
        let inv = Invocation::pack([65536, 65536, 1], [1, 1, 1], false, false).unwrap();
        assert_eq!(inv.invocations, u32::MAX);
        assert_eq!(inv.workgroups_x_shift(), 0);
        assert_eq!(inv.workgroups_z_shift(), 32);
    }
}
