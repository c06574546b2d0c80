//! Packing images into capacity-bounded batches.

use std::{
    mem,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use bytemuck::Zeroable;

use crate::{
    error::Error,
    frontend::FrontEnd,
    layout::CoefficientBuffer,
    metadata::{MetadataRecord, UnitCapacity},
    queue::WorkQueue,
};

/// An image admitted into a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchImage {
    pub path: PathBuf,
    /// Number of consecutive units assigned to the image.
    pub units: usize,
}

/// The images processed together in one device round-trip.
///
/// `metadata` and `mcus` always hold one entry per pool unit. Units not assigned to any image
/// carry a zeroed record and a zero-filled buffer.
pub struct Batch {
    pub images: Vec<BatchImage>,
    pub metadata: Vec<MetadataRecord>,
    pub mcus: Vec<CoefficientBuffer>,
}

impl Batch {
    pub fn new(units: usize, capacity: UnitCapacity) -> Self {
        Self {
            images: Vec::new(),
            metadata: vec![MetadataRecord::zeroed(); units],
            mcus: vec![vec![0; capacity.samples()]; units],
        }
    }

    /// Total number of units assigned to images.
    pub fn used_units(&self) -> usize {
        self.images.iter().map(|image| image.units).sum()
    }

    /// Yields every image together with the index of its first unit.
    pub fn unit_offsets(&self) -> impl Iterator<Item = (&BatchImage, usize)> + '_ {
        self.images.iter().scan(0, |cursor, image| {
            let offset = *cursor;
            *cursor += image.units;
            Some((image, offset))
        })
    }

    /// Returns `count` units starting at `start` to their unused state.
    fn release(&mut self, start: usize, count: usize) {
        for unit in start..start + count {
            self.metadata[unit] = MetadataRecord::zeroed();
            self.mcus[unit].fill(0);
        }
    }
}

/// Counters collected while assembling batches.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssemblyStats {
    /// Time spent parsing images and filling coefficient buffers.
    pub prepare: Duration,
    pub batches: usize,
    pub images_admitted: usize,
    /// Inputs that could not be read or decoded.
    pub skipped_invalid: usize,
    /// Inputs needing more units than the pool has.
    pub skipped_oversized: usize,
    /// Set when the consumer closed the queue before all inputs were processed.
    pub aborted: bool,
}

/// Greedily packs images into batches and pushes sealed batches onto a [`WorkQueue`].
pub struct BatchAssembler<F> {
    front_end: F,
    units: usize,
    capacity: UnitCapacity,
}

impl<F: FrontEnd> BatchAssembler<F> {
    pub fn new(front_end: F, units: usize, capacity: UnitCapacity) -> Self {
        Self {
            front_end,
            units,
            capacity,
        }
    }

    pub fn front_end(&self) -> &F {
        &self.front_end
    }

    /// Processes `paths` in order and closes `queue` when done.
    ///
    /// Per-file failures are logged and counted; they never stop the run. Returns early (with
    /// [`AssemblyStats::aborted`] set) if the queue is closed by the consumer.
    pub fn run(&mut self, paths: &[PathBuf], queue: &WorkQueue<Batch>) -> AssemblyStats {
        let mut stats = AssemblyStats::default();
        let mut batch = Batch::new(self.units, self.capacity);
        let mut free = self.units;
        let mut cursor = 0;

        for path in paths {
            let start = Instant::now();
            let image = match self.front_end.parse(path) {
                Ok(image) => image,
                Err(e) => {
                    log::error!("{}: {}", path.display(), e);
                    stats.skipped_invalid += 1;
                    stats.prepare += start.elapsed();
                    continue;
                }
            };
            let header = self.front_end.header(&image);
            let needed = header.units_needed(self.capacity);
            stats.prepare += start.elapsed();

            if needed > free {
                if !batch.images.is_empty() {
                    let next = Batch::new(self.units, self.capacity);
                    if !self.seal(mem::replace(&mut batch, next), queue, &mut stats) {
                        return stats;
                    }
                }
                free = self.units;
                cursor = 0;
            }
            if needed > self.units {
                let e = Error::capacity(format!(
                    "image needs {} units, but the pool only has {}",
                    needed, self.units
                ));
                log::error!("{}: {}", path.display(), e);
                stats.skipped_oversized += 1;
                continue;
            }

            let start = Instant::now();
            let record = MetadataRecord::new(header, self.capacity);
            batch.metadata[cursor..cursor + needed].fill(record);
            let filled =
                self.front_end
                    .fill_coefficients(&image, &mut batch.mcus, cursor, self.capacity);
            stats.prepare += start.elapsed();

            if let Err(e) = filled {
                log::error!("{}: {}", path.display(), e);
                batch.release(cursor, needed);
                stats.skipped_invalid += 1;
                continue;
            }

            log::trace!("{}: units {}..{}", path.display(), cursor, cursor + needed);
            batch.images.push(BatchImage {
                path: path.clone(),
                units: needed,
            });
            free -= needed;
            cursor += needed;
            stats.images_admitted += 1;
        }

        if !batch.images.is_empty() {
            self.seal(batch, queue, &mut stats);
        }
        queue.close();
        stats
    }

    fn seal(&self, batch: Batch, queue: &WorkQueue<Batch>, stats: &mut AssemblyStats) -> bool {
        log::debug!(
            "sealing batch {} with {} images on {}/{} units",
            stats.batches,
            batch.images.len(),
            batch.used_units(),
            self.units,
        );
        if queue.push(batch).is_err() {
            log::debug!("work queue closed, stopping batch assembly");
            stats.aborted = true;
            return false;
        }
        stats.batches += 1;
        true
    }
}

/// Returns the output path for `input`: its extension replaced by (or extended with) `bmp`.
pub fn output_path(input: &Path) -> PathBuf {
    input.with_extension("bmp")
}
