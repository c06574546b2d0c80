//! Coefficient buffer addressing.
//!
//! Each compute unit owns one flat buffer of `i16` samples. Macroblocks are stored in
//! *quad-groups*: 2x2 tiles of macroblocks that occupy [`QUAD_GROUP_STRIDE`] consecutive samples.
//! Inside a quad-group, channel `c` starts at `c * CHANNEL_STRIDE`, and the macroblock at 2x2
//! position `p` (row-major) occupies samples `p * 64 .. p * 64 + 64` of every channel region.
//!
//! Quad-groups are numbered row-major over the (even-padded) macroblock grid and assigned to
//! units in order, `capacity.quad_groups()` per unit.
//!
//! The front-end fill path, the reconstruction kernel, and both bitmap writers address samples
//! exclusively through this module.

use crate::metadata::UnitCapacity;

/// Samples per 8x8 block.
pub const BLOCK_SAMPLES: usize = 64;
/// Distance between the channel regions of a quad-group.
pub const CHANNEL_STRIDE: usize = 4 * BLOCK_SAMPLES;
/// Samples per quad-group (3 channels of 4 blocks).
pub const QUAD_GROUP_STRIDE: usize = 3 * CHANNEL_STRIDE;

/// One unit's coefficient storage.
pub type CoefficientBuffer = Vec<i16>;

/// Location of a sample in the per-unit coefficient buffers.
///
/// `unit` is relative to the first unit assigned to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleAddress {
    pub unit: usize,
    /// Offset of the channel 0 sample; add `c * CHANNEL_STRIDE` for channel `c`.
    pub offset: usize,
}

/// Returns the address of sample `(pixel_row, pixel_col)` of macroblock `mcu_index`, in an image
/// whose macroblock grid is `mcu_width` macroblocks wide.
#[inline]
pub fn sample_address(
    mcu_index: usize,
    pixel_row: usize,
    pixel_col: usize,
    mcu_width: usize,
    capacity: UnitCapacity,
) -> SampleAddress {
    debug_assert!(pixel_row < 8 && pixel_col < 8);
    let block = block_address(mcu_index, mcu_width, capacity);
    SampleAddress {
        unit: block.unit,
        offset: block.offset + pixel_row * 8 + pixel_col,
    }
}

/// Returns the address of the first sample of macroblock `mcu_index`.
#[inline]
pub fn block_address(mcu_index: usize, mcu_width: usize, capacity: UnitCapacity) -> SampleAddress {
    let mcu_row = mcu_index / mcu_width;
    let mcu_col = mcu_index % mcu_width;

    let quad_group = (mcu_row / 2) * ((mcu_width + 1) / 2) + mcu_col / 2;
    let subposition = (mcu_row % 2) * 2 + mcu_col % 2;

    let per_unit = capacity.quad_groups();
    SampleAddress {
        unit: quad_group / per_unit,
        offset: (quad_group % per_unit) * QUAD_GROUP_STRIDE + subposition * BLOCK_SAMPLES,
    }
}

/// Number of quad-groups covering a `mcu_width x mcu_height` macroblock grid.
#[inline]
pub fn quad_group_count(mcu_width: usize, mcu_height: usize) -> usize {
    ((mcu_width + 1) / 2) * ((mcu_height + 1) / 2)
}

/// Number of compute units needed to hold a `mcu_width x mcu_height` macroblock grid.
///
/// The grid is padded to even dimensions first, since storage is allocated in whole quad-groups.
#[inline]
pub fn units_needed(mcu_width: usize, mcu_height: usize, capacity: UnitCapacity) -> usize {
    let padded = quad_group_count(mcu_width, mcu_height) * 4;
    (padded + capacity.macroblocks() - 1) / capacity.macroblocks()
}
