//! Moving batches through the device pool and writing the results.

use std::time::Duration;

use crate::{
    batch::{output_path, Batch},
    bmp::BmpEncoder,
    device::{BufferName, DevicePool, Program},
    error::Result,
    queue::WorkQueue,
    timed,
};

/// Time spent in each offload stage, summed over all batches.
#[derive(Debug, Default, Clone, Copy)]
pub struct OffloadStats {
    pub program_load: Duration,
    /// Waiting for the assembler to deliver a batch.
    pub queue_wait: Duration,
    /// Preparing the per-unit views of a batch for transfer.
    pub handoff: Duration,
    pub to_device: Duration,
    pub execution: Duration,
    pub from_device: Duration,
    pub output_write: Duration,
    /// Number of device round-trips.
    pub rounds: usize,
    pub images_written: usize,
    pub output_failures: usize,
}

/// Consumes batches from `queue` until it is drained and closed.
///
/// Any device error aborts the loop. The queue is closed before returning it, so the producer
/// stops at its next push.
pub fn offload_loop<P: DevicePool + ?Sized>(
    pool: &mut P,
    program: &Program,
    queue: &WorkQueue<Batch>,
    encoder: &mut BmpEncoder,
) -> Result<OffloadStats> {
    let mut stats = OffloadStats::default();
    let result = run(pool, program, queue, encoder, &mut stats);
    if let Err(e) = &result {
        log::error!("device error, aborting: {e}");
        queue.close();
    }
    result.map(|()| stats)
}

fn run<P: DevicePool + ?Sized>(
    pool: &mut P,
    program: &Program,
    queue: &WorkQueue<Batch>,
    encoder: &mut BmpEncoder,
    stats: &mut OffloadStats,
) -> Result<()> {
    let (loaded, t) = timed(|| pool.load_program(program));
    stats.program_load += t;
    loaded?;

    loop {
        let (batch, t) = timed(|| queue.pop_blocking());
        stats.queue_wait += t;
        let Some(mut batch) = batch else { break };

        log::debug!(
            "offload round {}: {} images on {} units",
            stats.rounds,
            batch.images.len(),
            batch.used_units()
        );

        let ((metadata, mcus), t) = timed(|| {
            let metadata: Vec<&[u8]> = batch.metadata.iter().map(bytemuck::bytes_of).collect();
            let mcus: Vec<&[u8]> = batch
                .mcus
                .iter()
                .map(|unit| bytemuck::cast_slice(unit))
                .collect();
            (metadata, mcus)
        });
        stats.handoff += t;

        let (copied, t) = timed(|| {
            pool.copy_to_device(BufferName::Metadata, &metadata)?;
            pool.copy_to_device(BufferName::Mcus, &mcus)
        });
        stats.to_device += t;
        copied?;

        let (ran, t) = timed(|| pool.run());
        stats.execution += t;
        ran?;

        let (copied, t) = timed(|| {
            let mut mcus: Vec<&mut [u8]> = batch
                .mcus
                .iter_mut()
                .map(|unit| bytemuck::cast_slice_mut(unit))
                .collect();
            pool.copy_from_device(BufferName::Mcus, &mut mcus)
        });
        stats.from_device += t;
        copied?;

        let ((), t) = timed(|| write_images(&batch, encoder, stats));
        stats.output_write += t;
        stats.rounds += 1;
    }

    Ok(())
}

fn write_images(batch: &Batch, encoder: &mut BmpEncoder, stats: &mut OffloadStats) {
    for (image, start) in batch.unit_offsets() {
        let path = output_path(&image.path);
        log::trace!(
            "{}: writing units {}.. to {}",
            image.path.display(),
            start,
            path.display()
        );
        match encoder.write(&batch.metadata[start], &batch.mcus, start, &path) {
            Ok(()) => stats.images_written += 1,
            Err(e) => {
                log::error!("{}: {}", image.path.display(), e);
                stats.output_failures += 1;
            }
        }
    }
}
