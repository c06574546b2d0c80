use bytemuck::{Pod, Zeroable};

use crate::{
    error::{Error, Result},
    frontend::ImageHeader,
};

/// Number of `u32` words in a [`MetadataRecord`].
pub const METADATA_WORDS: usize = 20 + 4 * 64;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct QTable {
    pub values: [u32; 64], // natural (row-major) order
}

/// Per-unit image description, laid out exactly as the device kernel reads it.
///
/// Every unit assigned to an image carries an identical copy. Unused units carry an all-zero
/// record, which the kernel recognizes by its zero `unit_capacity`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct MetadataRecord {
    /// Coded MCU rows (in units of the largest vertical sampling factor).
    pub mcu_height: u32,
    /// Coded MCU columns.
    pub mcu_width: u32,
    /// Rows of 8x8 macroblocks covering the image.
    pub mcu_height_real: u32,
    /// Columns of 8x8 macroblocks covering the image.
    pub mcu_width_real: u32,
    pub component_count: u32,
    pub v_sampling: u32,
    pub h_sampling: u32,
    /// Quantization table id per component.
    pub qtable_ids: [u32; 3],
    pub component_h_sampling: [u32; 3],
    pub component_v_sampling: [u32; 3],
    pub _reserved: u32,
    pub height: u32,
    pub width: u32,
    /// Per-unit capacity in macroblocks.
    pub unit_capacity: u32,
    pub qtables: [QTable; 4],
}

const _: () = assert!(std::mem::size_of::<MetadataRecord>() == METADATA_WORDS * 4);

impl MetadataRecord {
    pub fn new(header: &ImageHeader, capacity: UnitCapacity) -> Self {
        let mut record = Self::zeroed();
        record.mcu_height = header.mcu_height;
        record.mcu_width = header.mcu_width;
        record.mcu_height_real = header.mcu_height_real;
        record.mcu_width_real = header.mcu_width_real;
        record.component_count = header.components.len() as u32;
        record.v_sampling = header.v_sampling;
        record.h_sampling = header.h_sampling;
        for (i, c) in header.components.iter().enumerate() {
            record.qtable_ids[i] = c.qtable;
            record.component_h_sampling[i] = c.h_sampling;
            record.component_v_sampling[i] = c.v_sampling;
        }
        record.height = header.height;
        record.width = header.width;
        record.unit_capacity = capacity.macroblocks() as u32;
        for (dest, src) in record.qtables.iter_mut().zip(&header.qtables) {
            if let Some(table) = src {
                dest.values = *table;
            }
        }
        record
    }

    /// Whether this record describes no image (an unused unit).
    #[inline]
    pub fn is_unused(&self) -> bool {
        self.unit_capacity == 0
    }
}

/// How many macroblocks a single compute unit can hold.
///
/// Always a non-zero multiple of 4, so that every unit holds whole quad-groups.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UnitCapacity(usize);

impl UnitCapacity {
    pub const DEFAULT: Self = Self(2048);

    pub fn new(macroblocks: usize) -> Result<Self> {
        if macroblocks == 0 || macroblocks % 4 != 0 {
            return Err(Error::from(format!(
                "unit capacity of {macroblocks} macroblocks is not a non-zero multiple of 4"
            )));
        }
        Ok(Self(macroblocks))
    }

    /// Creates a capacity from a number of quad-groups.
    pub fn from_quad_groups(quad_groups: usize) -> Result<Self> {
        Self::new(quad_groups * 4)
    }

    #[inline]
    pub fn macroblocks(self) -> usize {
        self.0
    }

    #[inline]
    pub fn quad_groups(self) -> usize {
        self.0 / 4
    }

    /// Number of `i16` samples in one unit's coefficient buffer.
    #[inline]
    pub fn samples(self) -> usize {
        self.quad_groups() * crate::layout::QUAD_GROUP_STRIDE
    }
}

impl Default for UnitCapacity {
    fn default() -> Self {
        Self::DEFAULT
    }
}
