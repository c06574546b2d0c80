//! Downloading buffer contents from the GPU.

use std::{ops::Deref, sync::mpsc};

use wgpu::*;

use crate::error::{Error, Result};

use super::Gpu;

/// A mappable staging buffer for reading back storage buffers.
pub struct Readback {
    buffer: Buffer,
}

impl Readback {
    pub fn new(gpu: &Gpu, size: BufferAddress) -> Self {
        Self {
            buffer: gpu.device.create_buffer(&BufferDescriptor {
                label: Some("readback"),
                mapped_at_creation: false,
                size,
                usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
            }),
        }
    }

    /// Copies all of `src` into the staging buffer and maps it for reading.
    ///
    /// Blocks until the copy has completed.
    pub fn download(&self, gpu: &Gpu, src: &Buffer) -> Result<Mapped<'_>> {
        if src.size() > self.buffer.size() {
            return Err(Error::device(format!(
                "cannot read back {} bytes through a {} byte staging buffer",
                src.size(),
                self.buffer.size()
            )));
        }

        let mut enc = gpu
            .device
            .create_command_encoder(&CommandEncoderDescriptor::default());
        enc.copy_buffer_to_buffer(src, 0, &self.buffer, 0, src.size());
        gpu.queue.submit([enc.finish()]);

        let slice = self.buffer.slice(..src.size());
        let (tx, rx) = mpsc::channel();
        slice.map_async(MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        gpu.device.poll(Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::device(format!("failed to map readback: {e}"))),
            Err(e) => return Err(Error::device(format!("failed to map readback: {e}"))),
        }

        Ok(Mapped {
            buffer: &self.buffer,
            view: Some(slice.get_mapped_range()),
        })
    }
}

/// A mapped view of a [`Readback`] buffer; unmaps on drop.
pub struct Mapped<'a> {
    buffer: &'a Buffer,
    view: Option<BufferView<'a>>,
}

impl<'a> Deref for Mapped<'a> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.view.as_deref().unwrap_or(&[])
    }
}

impl<'a> Drop for Mapped<'a> {
    fn drop(&mut self) {
        self.view.take();
        self.buffer.unmap();
    }
}
