//! The producer/consumer pipeline connecting assembler, device pool and encoder.

use std::{
    fmt,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use crate::{
    batch::{AssemblyStats, BatchAssembler},
    bmp::BmpEncoder,
    device::{DevicePool, Program},
    error::Result,
    frontend::FrontEnd,
    offload::{offload_loop, OffloadStats},
    queue::WorkQueue,
};

/// Timings and counters of a complete run.
#[derive(Debug, Default, Clone, Copy)]
pub struct Profile {
    pub end_to_end: Duration,
    pub assembly: AssemblyStats,
    pub offload: OffloadStats,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (a, o) = (&self.assembly, &self.offload);
        writeln!(f, "Profile:")?;
        writeln!(f, "End-to-end time: {:.6}s", self.end_to_end.as_secs_f64())?;
        writeln!(f, " - Batch preparation time: {:.6}s", a.prepare.as_secs_f64())?;
        writeln!(f, " - Queue waiting time: {:.6}s", o.queue_wait.as_secs_f64())?;
        writeln!(f, " - Batch handoff time: {:.6}s", o.handoff.as_secs_f64())?;
        writeln!(f, " - Host to device transfer time: {:.6}s", o.to_device.as_secs_f64())?;
        writeln!(f, " - Device execution time: {:.6}s", o.execution.as_secs_f64())?;
        writeln!(f, " - Device to host transfer time: {:.6}s", o.from_device.as_secs_f64())?;
        writeln!(f, " - Output write time: {:.6}s", o.output_write.as_secs_f64())?;
        writeln!(f, " - Offload rounds: {}", o.rounds)?;
        write!(
            f,
            " - Images written: {} (skipped: {} invalid, {} oversized, {} unwritable)",
            o.images_written, a.skipped_invalid, a.skipped_oversized, o.output_failures
        )
    }
}

/// Converts every image in `paths` to a bitmap next to it.
///
/// The assembler runs on its own thread and feeds the offload loop, which runs on the calling
/// thread. Per-file failures are logged and counted in the returned [`Profile`]; only device
/// errors are returned.
pub fn run<F, P>(
    paths: &[PathBuf],
    front_end: F,
    pool: &mut P,
    program: &Program,
) -> Result<Profile>
where
    F: FrontEnd + Send,
    P: DevicePool + ?Sized,
{
    let start = Instant::now();
    let queue = WorkQueue::new();
    let mut assembler = BatchAssembler::new(front_end, pool.unit_count(), pool.unit_capacity());
    let mut encoder = BmpEncoder::default();

    let (assembly, offload) = thread::scope(|s| {
        let producer = s.spawn(|| assembler.run(paths, &queue));
        let offload = offload_loop(pool, program, &queue, &mut encoder);
        let assembly = producer
            .join()
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
        (assembly, offload)
    });

    Ok(Profile {
        end_to_end: start.elapsed(),
        assembly,
        offload: offload?,
    })
}
