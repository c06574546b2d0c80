//! Batched JPEG macroblock reconstruction on a pool of compute units.
//!
//! Images are parsed and entropy-decoded on the host, packed into batches that fill a fixed pool
//! of capacity-limited compute units, transformed to RGB on the pool, and written out as 24-bit
//! bitmaps. Batch assembly and offloading run concurrently, connected by a [`WorkQueue`].

mod batch;
mod bits;
mod bmp;
mod device;
mod error;
mod file;
mod frontend;
mod huffman;
pub mod kernel;
pub mod layout;
mod metadata;
mod offload;
mod pipeline;
mod queue;
mod scan;
#[cfg(test)]
mod tests;

use std::time::{Duration, Instant};

pub use batch::{output_path, AssemblyStats, Batch, BatchAssembler, BatchImage};
pub use bmp::{BmpEncoder, Strategy};
pub use device::{
    Backend, BufferName, DevicePool, Gpu, GpuPool, HostKernel, HostPool, PoolConfig, Program,
};
pub use error::{Error, ErrorKind, Result};
pub use frontend::{ComponentInfo, FrontEnd, ImageHeader, JpegFrontEnd, JpegImage};
pub use metadata::{MetadataRecord, QTable, UnitCapacity, METADATA_WORDS};
pub use offload::{offload_loop, OffloadStats};
pub use pipeline::{run, Profile};
pub use queue::WorkQueue;

fn timed<R>(f: impl FnOnce() -> R) -> (R, Duration) {
    let start = Instant::now();
    let result = f();
    (result, start.elapsed())
}
