use std::thread;

use bytemuck::Zeroable;

use crate::{
    error::{Error, Result},
    kernel,
    metadata::{MetadataRecord, UnitCapacity},
};

use super::{check_transfer, BufferName, DevicePool, Program};

/// Per-unit transform run by a [`HostPool`].
pub type HostKernel = fn(&MetadataRecord, &mut [i16]);

/// A device pool emulated on the host.
///
/// Units keep their buffers in host memory and execute concurrently on scoped threads, one
/// chunk of units per available core.
pub struct HostPool {
    capacity: UnitCapacity,
    kernel: HostKernel,
    program: Option<String>,
    metadata: Vec<MetadataRecord>,
    mcus: Vec<Vec<i16>>,
}

impl HostPool {
    /// Creates a pool running the reference reconstruction kernel.
    pub fn new(units: usize, capacity: UnitCapacity) -> Result<Self> {
        Self::with_kernel(units, capacity, kernel::reconstruct_unit)
    }

    pub fn with_kernel(units: usize, capacity: UnitCapacity, kernel: HostKernel) -> Result<Self> {
        if units == 0 {
            return Err(Error::device("cannot allocate a pool of 0 units"));
        }
        log::debug!(
            "allocating {} host units of {} macroblocks",
            units,
            capacity.macroblocks()
        );
        Ok(Self {
            capacity,
            kernel,
            program: None,
            metadata: vec![MetadataRecord::zeroed(); units],
            mcus: vec![vec![0; capacity.samples()]; units],
        })
    }
}

impl DevicePool for HostPool {
    fn unit_count(&self) -> usize {
        self.metadata.len()
    }

    fn unit_capacity(&self) -> UnitCapacity {
        self.capacity
    }

    fn load_program(&mut self, program: &Program) -> Result<()> {
        log::debug!("host pool: loading program '{}'", program.label());
        self.program = Some(program.label().to_string());
        Ok(())
    }

    fn copy_to_device(&mut self, buffer: BufferName, units: &[&[u8]]) -> Result<()> {
        check_transfer(&*self, buffer, units.iter().map(|u| u.len()))?;
        match buffer {
            BufferName::Metadata => {
                for (dest, src) in self.metadata.iter_mut().zip(units) {
                    *dest = bytemuck::pod_read_unaligned(src);
                }
            }
            BufferName::Mcus => {
                for (dest, src) in self.mcus.iter_mut().zip(units) {
                    bytemuck::cast_slice_mut::<i16, u8>(dest).copy_from_slice(src);
                }
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let Some(program) = &self.program else {
            return Err(Error::device("no program loaded"));
        };
        log::trace!("host pool: running '{}' on {} units", program, self.mcus.len());

        let threads = thread::available_parallelism().map_or(1, usize::from);
        let chunk = (self.mcus.len() + threads - 1) / threads;
        let kernel = self.kernel;
        thread::scope(|s| {
            let units = self.metadata.chunks(chunk).zip(self.mcus.chunks_mut(chunk));
            for (records, buffers) in units {
                s.spawn(move || {
                    for (record, mcus) in records.iter().zip(buffers) {
                        kernel(record, mcus);
                    }
                });
            }
        });
        Ok(())
    }

    fn copy_from_device(&mut self, buffer: BufferName, units: &mut [&mut [u8]]) -> Result<()> {
        check_transfer(&*self, buffer, units.iter().map(|u| u.len()))?;
        match buffer {
            BufferName::Metadata => {
                for (src, dest) in self.metadata.iter().zip(units) {
                    dest.copy_from_slice(bytemuck::bytes_of(src));
                }
            }
            BufferName::Mcus => {
                for (src, dest) in self.mcus.iter().zip(units) {
                    dest.copy_from_slice(bytemuck::cast_slice(src));
                }
            }
        }
        Ok(())
    }
}
