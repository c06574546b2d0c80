//! 24-bit bitmap output.
//!
//! Files use the 12-byte `BITMAPCOREHEADER`: a 14-byte file header, the core header, then
//! bottom-up rows of B, G, R triplets, each row zero-padded to a multiple of 4 bytes.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::Path,
};

use crate::{
    error::{Error, Result},
    layout::{self, CoefficientBuffer, CHANNEL_STRIDE},
    metadata::{MetadataRecord, UnitCapacity},
};

pub const FILE_HEADER_SIZE: usize = 14;
pub const CORE_HEADER_SIZE: usize = 12;
pub const HEADER_SIZE: usize = FILE_HEADER_SIZE + CORE_HEADER_SIZE;

/// Files are written in pieces of this size.
const WRITE_CHUNK: usize = 1 << 20;

/// Number of zero bytes appended to each row of a `width` pixel image.
#[inline]
pub fn row_padding(width: usize) -> usize {
    (4 - (3 * width) % 4) % 4
}

/// Total file size of a `width x height` bitmap.
#[inline]
pub fn file_size(width: usize, height: usize) -> usize {
    HEADER_SIZE + (3 * width + row_padding(width)) * height
}

/// How the raster is gathered from the coefficient buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Walks the output row by row and looks up every pixel's address.
    Scanline,
    /// Walks the macroblocks and copies each one's rows into a preallocated raster.
    #[default]
    Direct,
}

/// Encodes images from the transformed coefficient buffers.
///
/// Channels 0, 1 and 2 of each macroblock hold the red, green and blue samples. Reuses one output
/// buffer across images.
#[derive(Default)]
pub struct BmpEncoder {
    strategy: Strategy,
    buf: Vec<u8>,
}

impl BmpEncoder {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            buf: Vec::new(),
        }
    }

    /// Renders the image described by `record`, whose first unit is `units[start_unit]`, into a
    /// complete bitmap file image.
    pub fn encode(
        &mut self,
        record: &MetadataRecord,
        units: &[CoefficientBuffer],
        start_unit: usize,
    ) -> Result<&[u8]> {
        let image = ImageRegion::new(record, units, start_unit)?;
        self.buf.clear();
        write_header(&mut self.buf, image.width, image.height);
        match self.strategy {
            Strategy::Scanline => render_scanline(&mut self.buf, &image),
            Strategy::Direct => render_direct(&mut self.buf, &image),
        }
        debug_assert_eq!(self.buf.len(), file_size(image.width, image.height));
        Ok(&self.buf)
    }

    /// Encodes the image and writes it to `path`.
    ///
    /// Nothing is written if the image is inconsistent with its units or `path` can not be
    /// created. A file that fails partway through writing is removed again.
    pub fn write(
        &mut self,
        record: &MetadataRecord,
        units: &[CoefficientBuffer],
        start_unit: usize,
        path: &Path,
    ) -> Result<()> {
        let output_error =
            |e: std::io::Error| Error::output(format!("cannot write {}: {}", path.display(), e));

        let bytes = self.encode(record, units, start_unit)?;
        save(bytes, path, |path| File::create(path)).map_err(output_error)
    }
}

/// Writes `bytes` to the sink `open` creates at `path`, deleting `path` if any write fails.
fn save<W: Write>(
    bytes: &[u8],
    path: &Path,
    open: impl FnOnce(&Path) -> io::Result<W>,
) -> io::Result<()> {
    let mut out = open(path)?;
    let res = bytes
        .chunks(WRITE_CHUNK)
        .try_for_each(|chunk| out.write_all(chunk))
        .and_then(|()| out.flush());
    if res.is_err() {
        drop(out);
        fs::remove_file(path).ok();
    }
    res
}

/// An image's slice of a batch, validated against its metadata record.
struct ImageRegion<'a> {
    units: &'a [CoefficientBuffer],
    width: usize,
    height: usize,
    mcu_width: usize,
    capacity: UnitCapacity,
}

impl<'a> ImageRegion<'a> {
    fn new(
        record: &MetadataRecord,
        units: &'a [CoefficientBuffer],
        start_unit: usize,
    ) -> Result<Self> {
        let width = record.width as usize;
        let height = record.height as usize;
        let mcu_width = record.mcu_width_real as usize;
        let mcu_height = record.mcu_height_real as usize;
        let capacity = UnitCapacity::new(record.unit_capacity as usize)
            .map_err(|e| Error::output(format!("invalid metadata record: {e}")))?;

        if width == 0 || height == 0 || width > 0xffff || height > 0xffff {
            return Err(Error::output(format!(
                "image size {width}x{height} cannot be stored in a core bitmap header"
            )));
        }
        if u32::try_from(file_size(width, height)).is_err() {
            return Err(Error::output(format!(
                "{width}x{height} bitmap exceeds the 4 GiB file size limit"
            )));
        }
        if mcu_width * 8 < width || mcu_height * 8 < height {
            return Err(Error::output(format!(
                "{mcu_width}x{mcu_height} macroblocks do not cover {width}x{height} pixels"
            )));
        }
        let needed = layout::units_needed(mcu_width, mcu_height, capacity);
        let Some(units) = units.get(start_unit..start_unit + needed) else {
            return Err(Error::output(format!(
                "image needs units {}..{} but the batch has {}",
                start_unit,
                start_unit + needed,
                units.len()
            )));
        };
        if units.iter().any(|unit| unit.len() < capacity.samples()) {
            return Err(Error::output("coefficient buffer smaller than unit capacity"));
        }

        Ok(Self {
            units,
            width,
            height,
            mcu_width,
            capacity,
        })
    }
}

fn write_header(buf: &mut Vec<u8>, width: usize, height: usize) {
    let size = file_size(width, height) as u32;
    buf.reserve(size as usize);
    buf.extend_from_slice(b"BM");
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&[0; 4]); // reserved
    buf.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
    buf.extend_from_slice(&(CORE_HEADER_SIZE as u32).to_le_bytes());
    buf.extend_from_slice(&(width as u16).to_le_bytes());
    buf.extend_from_slice(&(height as u16).to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // planes
    buf.extend_from_slice(&24u16.to_le_bytes()); // bits per pixel
}

fn render_scanline(buf: &mut Vec<u8>, image: &ImageRegion<'_>) {
    let padding = row_padding(image.width);
    for y in (0..image.height).rev() {
        for x in 0..image.width {
            let mcu = (y / 8) * image.mcu_width + x / 8;
            let addr = layout::sample_address(mcu, y % 8, x % 8, image.mcu_width, image.capacity);
            let unit = &image.units[addr.unit];
            buf.push(unit[addr.offset + 2 * CHANNEL_STRIDE] as u8);
            buf.push(unit[addr.offset + CHANNEL_STRIDE] as u8);
            buf.push(unit[addr.offset] as u8);
        }
        buf.extend(std::iter::repeat(0).take(padding));
    }
}

fn render_direct(buf: &mut Vec<u8>, image: &ImageRegion<'_>) {
    let stride = 3 * image.width + row_padding(image.width);
    let (width, height) = (image.width, image.height);
    buf.resize(HEADER_SIZE + stride * height, 0);
    let raster = &mut buf[HEADER_SIZE..];

    let mcu_height = (height + 7) >> 3;
    for mcu_row in 0..mcu_height {
        let y0 = mcu_row << 3;
        let rows = (height - y0).min(8);
        for mcu_col in 0..image.mcu_width {
            let x0 = mcu_col << 3;
            if x0 >= width {
                break;
            }
            let cols = (width - x0).min(8);
            let block = layout::block_address(
                mcu_row * image.mcu_width + mcu_col,
                image.mcu_width,
                image.capacity,
            );
            let unit = &image.units[block.unit];
            for py in 0..rows {
                let src = block.offset + (py << 3);
                let red = &unit[src..src + cols];
                let green = &unit[src + CHANNEL_STRIDE..][..cols];
                let blue = &unit[src + 2 * CHANNEL_STRIDE..][..cols];

                let row = (height - 1 - (y0 | py)) * stride + x0 * 3;
                let dst = &mut raster[row..row + cols * 3];
                for (px, bgr) in dst.chunks_exact_mut(3).enumerate() {
                    bgr[0] = blue[px] as u8;
                    bgr[1] = green[px] as u8;
                    bgr[2] = red[px] as u8;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::Zeroable;

    use super::*;
    use crate::ErrorKind;

    fn record(width: u32, height: u32, capacity: UnitCapacity) -> MetadataRecord {
        let mut record = MetadataRecord::zeroed();
        record.width = width;
        record.height = height;
        record.mcu_width_real = (width + 7) / 8;
        record.mcu_height_real = (height + 7) / 8;
        record.unit_capacity = capacity.macroblocks() as u32;
        record
    }

    /// Channel `c` of macroblock `mcu` holds `(mcu * 3 + c) % 256`.
    fn constant_blocks(
        record: &MetadataRecord,
        capacity: UnitCapacity,
        first_unit: usize,
    ) -> Vec<Vec<i16>> {
        let w = record.mcu_width_real as usize;
        let h = record.mcu_height_real as usize;
        let count = first_unit + layout::units_needed(w, h, capacity);
        let mut units = vec![vec![0; capacity.samples()]; count];
        for mcu in 0..w * h {
            let addr = layout::block_address(mcu, w, capacity);
            for c in 0..3 {
                let start = addr.offset + c * CHANNEL_STRIDE;
                let value = ((mcu * 3 + c) % 256) as i16;
                units[first_unit + addr.unit][start..start + 64].fill(value);
            }
        }
        units
    }

    fn pixel(bmp: &[u8], width: usize, height: usize, x: usize, y: usize) -> [u8; 3] {
        let stride = 3 * width + row_padding(width);
        let i = HEADER_SIZE + (height - 1 - y) * stride + 3 * x;
        [bmp[i + 2], bmp[i + 1], bmp[i]]
    }

    #[test]
    fn header_layout() {
        let cap = UnitCapacity::from_quad_groups(1).unwrap();
        let units = vec![vec![0; cap.samples()]; 1];
        let mut enc = BmpEncoder::new(Strategy::Scanline);
        let bmp = enc.encode(&record(5, 3, cap), &units, 0).unwrap();
        assert_eq!(
            &bmp[..HEADER_SIZE],
            &[
                b'B', b'M', //
                74, 0, 0, 0, // 26 + 16 * 3
                0, 0, 0, 0, //
                0x1A, 0, 0, 0, //
                12, 0, 0, 0, //
                5, 0, 3, 0, //
                1, 0, 24, 0,
            ]
        );
        assert_eq!(bmp.len(), 74);
    }

    #[test]
    fn padding() {
        assert_eq!(row_padding(1), 1);
        assert_eq!(row_padding(2), 2);
        assert_eq!(row_padding(3), 3);
        assert_eq!(row_padding(4), 0);
        assert_eq!(row_padding(5), 1);
        assert_eq!(file_size(9, 9), 26 + 28 * 9);

        let cap = UnitCapacity::from_quad_groups(2).unwrap();
        for width in 1..=13 {
            let rec = record(width, 2, cap);
            let units = vec![vec![255; cap.samples()]; 2];
            for strategy in [Strategy::Scanline, Strategy::Direct] {
                let bmp = BmpEncoder::new(strategy)
                    .encode(&rec, &units, 0)
                    .unwrap()
                    .to_vec();
                let w = width as usize;
                let stride = 3 * w + row_padding(w);
                assert_eq!(stride % 4, 0);
                assert_eq!(bmp.len(), file_size(w, 2));
                let size = u32::from_le_bytes(bmp[2..6].try_into().unwrap());
                assert_eq!(size as usize, bmp.len());
                for row in bmp[HEADER_SIZE..].chunks(stride) {
                    assert!(row[..3 * w].iter().all(|&b| b == 255));
                    assert!(row[3 * w..].iter().all(|&b| b == 0));
                }
            }
        }
    }

    #[test]
    fn macroblock_constants() {
        let cap = UnitCapacity::from_quad_groups(2).unwrap();
        for (width, height) in [(9, 9), (16, 16), (17, 5), (40, 24), (1, 33)] {
            let rec = record(width, height, cap);
            let units = constant_blocks(&rec, cap, 1);
            let (w, h) = (width as usize, height as usize);
            let mut scanline = BmpEncoder::new(Strategy::Scanline);
            let mut direct = BmpEncoder::new(Strategy::Direct);
            let a = scanline.encode(&rec, &units, 1).unwrap();
            let b = direct.encode(&rec, &units, 1).unwrap();
            assert_eq!(a, b, "{width}x{height}");

            for y in 0..h {
                for x in 0..w {
                    let mcu = (y / 8) * rec.mcu_width_real as usize + x / 8;
                    let expected = [0, 1, 2].map(|c| ((mcu * 3 + c) % 256) as u8);
                    assert_eq!(pixel(a, w, h, x, y), expected, "{width}x{height} at {x},{y}");
                }
            }
        }
    }

    #[test]
    fn variants_agree_on_random_samples() {
        let mut rng = fastrand::Rng::with_seed(77);
        for _ in 0..20 {
            let cap = UnitCapacity::from_quad_groups(rng.usize(1..=3)).unwrap();
            let rec = record(rng.u32(1..=50), rng.u32(1..=50), cap);
            let needed = layout::units_needed(
                rec.mcu_width_real as usize,
                rec.mcu_height_real as usize,
                cap,
            );
            let units: Vec<Vec<i16>> = (0..needed)
                .map(|_| (0..cap.samples()).map(|_| rng.i16(0..=255)).collect())
                .collect();
            let a = BmpEncoder::new(Strategy::Scanline)
                .encode(&rec, &units, 0)
                .unwrap()
                .to_vec();
            let b = BmpEncoder::new(Strategy::Direct)
                .encode(&rec, &units, 0)
                .unwrap()
                .to_vec();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn inconsistent_metadata() {
        let cap = UnitCapacity::from_quad_groups(1).unwrap();
        let units = vec![vec![0; cap.samples()]; 1];
        let mut enc = BmpEncoder::default();

        // 24x24 needs 4 units.
        let err = enc.encode(&record(24, 24, cap), &units, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Output);

        let err = enc.encode(&MetadataRecord::zeroed(), &units, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Output);
    }

    #[test]
    fn oversized_raster() {
        let cap = UnitCapacity::from_quad_groups(1).unwrap();
        let err = BmpEncoder::default()
            .encode(&record(0xffff, 0xffff, cap), &[], 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Output);
        assert!(err.to_string().contains("4 GiB"), "{err}");

        // 37000 * 3 * 37000 stays below the limit, so the unit check fails instead.
        let err = BmpEncoder::default()
            .encode(&record(37000, 37000, cap), &[], 0)
            .unwrap_err();
        assert!(!err.to_string().contains("4 GiB"), "{err}");
    }

    /// Accepts `budget` bytes, then fails like a full disk.
    struct ShortWriter<W> {
        inner: W,
        budget: usize,
    }

    impl<W: Write> Write for ShortWriter<W> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.inner.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    #[test]
    fn failed_write_leaves_no_file() {
        let cap = UnitCapacity::from_quad_groups(1).unwrap();
        let units = vec![vec![0; cap.samples()]; 1];
        let bytes = BmpEncoder::default()
            .encode(&record(8, 8, cap), &units, 0)
            .unwrap()
            .to_vec();

        let path = std::env::temp_dir().join(format!("jpegpool-short-{}.bmp", std::process::id()));
        let open = |budget| {
            move |path: &Path| {
                File::create(path).map(|inner| ShortWriter { inner, budget })
            }
        };

        save(&bytes, &path, open(40)).unwrap_err();
        assert!(!path.exists());

        save(&bytes, &path, open(usize::MAX)).unwrap();
        assert_eq!(fs::read(&path).unwrap(), bytes);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn unwritable_destination() {
        let cap = UnitCapacity::from_quad_groups(1).unwrap();
        let units = vec![vec![0; cap.samples()]; 1];
        let path = Path::new("/nonexistent-dir/out.bmp");
        let err = BmpEncoder::default()
            .write(&record(8, 8, cap), &units, 0, path)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Output);
        assert!(!path.exists());
    }
}
