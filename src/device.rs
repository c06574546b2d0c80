//! The accelerator device pool.
//!
//! A pool is a fixed set of compute units. Each unit owns one slot in every named buffer and runs
//! the loaded program over its own slots only. Two backends exist: [`GpuPool`] runs the program
//! as a wgpu compute shader, [`HostPool`] emulates the units with host threads.

mod gpu;
mod host;
mod readback;

use std::{
    borrow::Cow,
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::{
    error::{Error, Result},
    metadata::{UnitCapacity, METADATA_WORDS},
};

pub use gpu::{Gpu, GpuPool};
pub use host::{HostKernel, HostPool};

/// Named per-unit buffers of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferName {
    /// One [`MetadataRecord`](crate::metadata::MetadataRecord) per unit.
    Metadata,
    /// One coefficient buffer per unit.
    Mcus,
}

impl BufferName {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferName::Metadata => "metadata_buffer",
            BufferName::Mcus => "mcus",
        }
    }

    /// Size in bytes of one unit's slot in this buffer.
    pub fn unit_bytes(self, capacity: UnitCapacity) -> usize {
        match self {
            BufferName::Metadata => METADATA_WORDS * 4,
            BufferName::Mcus => capacity.samples() * 2,
        }
    }
}

impl fmt::Display for BufferName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WGSL source of the reconstruction kernel.
///
/// The entry point is `reconstruct`. [`HostPool`] does not interpret the source, but still
/// requires a program to be loaded before [`DevicePool::run`].
#[derive(Debug, Clone)]
pub struct Program {
    label: String,
    source: Cow<'static, str>,
}

impl Program {
    pub const ENTRY_POINT: &'static str = "reconstruct";

    /// The kernel shipped with this crate.
    pub fn builtin() -> Self {
        Self {
            label: "reconstruct.wgsl".into(),
            source: include_str!("device/reconstruct.wgsl").into(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path).map_err(|e| {
            Error::device(format!("failed to load program {}: {}", path.display(), e))
        })?;
        Ok(Self {
            label: path.display().to_string(),
            source: source.into(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// A pool of compute units that transforms coefficient buffers in place.
///
/// Every transfer covers all units at once: `units[i]` is unit `i`'s slot and must be exactly
/// [`BufferName::unit_bytes`] long. All failures are [`ErrorKind::Device`] errors.
///
/// [`ErrorKind::Device`]: crate::ErrorKind::Device
pub trait DevicePool: Send {
    fn unit_count(&self) -> usize;

    fn unit_capacity(&self) -> UnitCapacity;

    fn load_program(&mut self, program: &Program) -> Result<()>;

    fn copy_to_device(&mut self, buffer: BufferName, units: &[&[u8]]) -> Result<()>;

    /// Runs the loaded program on every unit and blocks until all of them are done.
    fn run(&mut self) -> Result<()>;

    fn copy_from_device(&mut self, buffer: BufferName, units: &mut [&mut [u8]]) -> Result<()>;
}

/// Validates the shape of a transfer against the pool.
fn check_transfer(
    pool: &dyn DevicePool,
    buffer: BufferName,
    lengths: impl ExactSizeIterator<Item = usize>,
) -> Result<()> {
    if lengths.len() != pool.unit_count() {
        return Err(Error::device(format!(
            "transfer to '{}' covers {} units, but the pool has {}",
            buffer,
            lengths.len(),
            pool.unit_count()
        )));
    }
    let expected = buffer.unit_bytes(pool.unit_capacity());
    for (unit, len) in lengths.enumerate() {
        if len != expected {
            return Err(Error::device(format!(
                "slot of unit {} in '{}' is {} bytes, expected {}",
                unit, buffer, len, expected
            )));
        }
    }
    Ok(())
}

/// Which pool implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Gpu,
    Host,
}

/// Pool allocation settings.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    pub backend: Backend,
    /// Number of units to allocate; `None` allocates all the backend offers.
    pub units: Option<usize>,
    pub unit_capacity: UnitCapacity,
    /// Kernel source to load instead of the built-in one.
    pub program: Option<PathBuf>,
}

impl PoolConfig {
    /// Units allocated by the GPU backend when no count is configured.
    pub const GPU_UNITS: usize = 64;

    /// Allocates the configured pool.
    pub fn open(&self) -> Result<Box<dyn DevicePool>> {
        match self.backend {
            Backend::Gpu => {
                let units = self.units.unwrap_or(Self::GPU_UNITS);
                let gpu = pollster::block_on(Gpu::open())?;
                Ok(Box::new(GpuPool::new(gpu.into(), units, self.unit_capacity)?))
            }
            Backend::Host => {
                let units = match self.units {
                    Some(units) => units,
                    None => std::thread::available_parallelism()
                        .map(usize::from)
                        .unwrap_or(1),
                };
                Ok(Box::new(HostPool::new(units, self.unit_capacity)?))
            }
        }
    }

    pub fn program(&self) -> Result<Program> {
        match &self.program {
            Some(path) => Program::from_path(path),
            None => Ok(Program::builtin()),
        }
    }
}
