//! Image front-ends: header parsing and coefficient extraction.

use std::{fs, path::Path};

use crate::{
    bits::BitStream,
    error::{Error, Result},
    file::{FrameHeader, Segment, Segments},
    huffman::{CanonicalCodes, HuffmanLut},
    layout::{self, CoefficientBuffer, CHANNEL_STRIDE},
    metadata::UnitCapacity,
    scan::ScanBuffer,
};

/// Maps zig-zag positions to natural (row-major) positions within an 8x8 block.
pub const ZIGZAG: [u8; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27, 20,
    13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58, 59,
    52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentInfo {
    pub h_sampling: u32,
    pub v_sampling: u32,
    pub qtable: u32,
}

/// Everything the batch assembler and the device kernel need to know about an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
    /// Coded MCU grid (MCUs span `8 * h_sampling` by `8 * v_sampling` pixels).
    pub mcu_width: u32,
    pub mcu_height: u32,
    /// 8x8 macroblock grid covering the image.
    pub mcu_width_real: u32,
    pub mcu_height_real: u32,
    pub h_sampling: u32,
    pub v_sampling: u32,
    /// 1 or 3 components.
    pub components: Vec<ComponentInfo>,
    /// Quantization tables in natural order.
    pub qtables: [Option<[u32; 64]>; 4],
}

impl ImageHeader {
    /// Builds a header for a `width x height` image with the given sampling factors and
    /// computes the derived grid dimensions.
    pub fn new(width: u32, height: u32, components: Vec<ComponentInfo>) -> Self {
        let h_sampling = components.iter().map(|c| c.h_sampling).max().unwrap_or(1);
        let v_sampling = components.iter().map(|c| c.v_sampling).max().unwrap_or(1);
        Self {
            width,
            height,
            mcu_width: (width + 8 * h_sampling - 1) / (8 * h_sampling),
            mcu_height: (height + 8 * v_sampling - 1) / (8 * v_sampling),
            mcu_width_real: (width + 7) / 8,
            mcu_height_real: (height + 7) / 8,
            h_sampling,
            v_sampling,
            components,
            qtables: [None; 4],
        }
    }

    /// Number of compute units the image occupies.
    pub fn units_needed(&self, capacity: UnitCapacity) -> usize {
        layout::units_needed(
            self.mcu_width_real as usize,
            self.mcu_height_real as usize,
            capacity,
        )
    }
}

/// Source of image headers and untransformed block coefficients.
pub trait FrontEnd {
    type Image;

    /// Reads and validates the image at `path`.
    fn parse(&mut self, path: &Path) -> Result<Self::Image>;

    fn header<'a>(&self, image: &'a Self::Image) -> &'a ImageHeader;

    /// Writes the image's coefficients into `units`, starting at unit `unit_offset`.
    ///
    /// The target units must be zero-filled. Samples are placed with
    /// [`layout::block_address`]; chroma blocks of subsampled images go to the channel region of
    /// the top-left macroblock of their MCU.
    fn fill_coefficients(
        &mut self,
        image: &Self::Image,
        units: &mut [CoefficientBuffer],
        unit_offset: usize,
        capacity: UnitCapacity,
    ) -> Result<()>;
}

/// A parsed baseline JPEG file.
pub struct JpegImage {
    header: ImageHeader,
    /// Indexed by `(class << 1) | destination`.
    huffman_tables: [Option<HuffmanLut>; 4],
    /// `(dc, ac)` huffman destinations per component.
    component_tables: Vec<(u8, u8)>,
    restart_interval: u32,
    scan_data: Vec<u8>,
}

impl JpegImage {
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Parses an in-memory baseline JPEG.
    pub fn new(jpeg: &[u8]) -> Result<Self> {
        macro_rules! bail {
            ($($args:tt)*) => {
                return Err(Error::from(format!(
                    $($args)*
                )))
            };
        }

        let mut frame = None;
        let mut qtables = [None; 4];
        let mut huffman_tables: [Option<HuffmanLut>; 4] = Default::default();
        let mut restart_interval = 0;
        let mut scan = None;

        for marked in Segments::new(jpeg)? {
            match marked?.segment {
                Segment::Frame(sof) => {
                    if !sof.coding.is_baseline() {
                        bail!("{:?} frames are not supported", sof.coding);
                    }
                    if sof.precision != 8 {
                        bail!("sample precision of {} bits is not supported", sof.precision);
                    }
                    if frame.is_some() {
                        bail!("encountered multiple frame headers");
                    }
                    if sof.width == 0 || sof.height == 0 {
                        bail!("image dimensions {}x{} are not supported", sof.width, sof.height);
                    }
                    frame = Some(frame_components(&sof)?);
                }
                Segment::QuantTables(tables) => {
                    for table in tables {
                        let Some(dest) = qtables.get_mut(usize::from(table.dest)) else {
                            bail!("invalid quantization table destination {}", table.dest);
                        };
                        let mut natural = [0; 64];
                        for (&pos, &q) in ZIGZAG.iter().zip(&table.zigzag) {
                            natural[usize::from(pos)] = u32::from(q);
                        }
                        *dest = Some(natural);
                    }
                }
                Segment::HuffmanTables(tables) => {
                    for table in tables {
                        if table.class > 1 || table.dest > 1 {
                            bail!(
                                "huffman table {}/{} is not valid in a baseline JPEG",
                                table.class,
                                table.dest
                            );
                        }
                        let codes = CanonicalCodes::new(&table.counts, table.values)?;
                        let index = usize::from((table.class << 1) | table.dest);
                        huffman_tables[index] = Some(codes.decoder());
                    }
                }
                Segment::RestartInterval(ri) => restart_interval = u32::from(ri),
                Segment::Scan(sos) => {
                    if !sos.is_sequential() {
                        bail!("progressive or successive-approximation scans are not supported");
                    }
                    let Some((_, ids)) = &frame else {
                        bail!("scan header before frame header");
                    };
                    if scan.is_some() {
                        bail!("multiple scans are not supported");
                    }
                    let selectors: Vec<u8> = sos.components.iter().map(|c| c.selector).collect();
                    if &selectors != ids {
                        bail!(
                            "scan component mismatch (expected {:?}, got {:?})",
                            ids,
                            selectors
                        );
                    }
                    let tables = sos
                        .components
                        .iter()
                        .map(|c| (c.dc_table, c.ac_table))
                        .collect::<Vec<_>>();
                    scan = Some((tables, sos.data.to_vec()));
                }
                Segment::Ignored => {}
            }
        }

        let (Some((mut header, _)), Some((component_tables, scan_data))) = (frame, scan) else {
            bail!("missing SOF/SOS marker");
        };

        for (i, c) in header.components.iter().enumerate() {
            if qtables[c.qtable as usize].is_none() {
                bail!("component {i} uses undefined quantization table {}", c.qtable);
            }
        }
        for &(dc, ac) in &component_tables {
            if dc > 1 || ac > 1 {
                bail!("invalid huffman table selection {dc}/{ac}");
            }
            if huffman_tables[usize::from(dc)].is_none()
                || huffman_tables[usize::from(2 | ac)].is_none()
            {
                bail!("scan uses undefined huffman table {dc}/{ac}");
            }
        }
        header.qtables = qtables;

        Ok(Self {
            header,
            huffman_tables,
            component_tables,
            restart_interval,
            scan_data,
        })
    }

    fn expected_restart_intervals(&self) -> u32 {
        let mcus = self.header.mcu_width * self.header.mcu_height;
        match self.restart_interval {
            0 => 1,
            ri => (mcus + ri - 1) / ri,
        }
    }

    /// Entropy-decodes the scan and stores every block at its layout address.
    fn decode_into(
        &self,
        scan: &mut ScanBuffer,
        units: &mut [CoefficientBuffer],
        capacity: UnitCapacity,
    ) -> Result<()> {
        let h = &self.header;
        scan.process(&self.scan_data, self.expected_restart_intervals())?;

        let total_mcus = (h.mcu_width * h.mcu_height) as usize;
        let per_interval = match self.restart_interval {
            0 => total_mcus,
            ri => ri as usize,
        };

        let mut block = [0i16; 64];
        for interval in 0..scan.interval_count() {
            let mut bits = BitStream::new(scan.interval(interval));
            let mut predictors = [0i32; 3];

            let first = interval * per_interval;
            for mcu in first..total_mcus.min(first + per_interval) {
                let mcu_x = (mcu % h.mcu_width as usize) * h.h_sampling as usize;
                let mcu_y = (mcu / h.mcu_width as usize) * h.v_sampling as usize;

                for (c, component) in h.components.iter().enumerate() {
                    let (dc, ac) = self.component_tables[c];
                    for v in 0..component.v_sampling as usize {
                        for u in 0..component.h_sampling as usize {
                            self.decode_block(&mut bits, dc, ac, &mut predictors[c], &mut block)?;

                            let (bx, by) = (mcu_x + u, mcu_y + v);
                            if bx >= h.mcu_width_real as usize || by >= h.mcu_height_real as usize {
                                continue;
                            }
                            let mcu_index = by * h.mcu_width_real as usize + bx;
                            let addr =
                                layout::block_address(mcu_index, h.mcu_width_real as usize, capacity);
                            let start = addr.offset + c * CHANNEL_STRIDE;
                            let Some(unit) = units.get_mut(addr.unit) else {
                                return Err(Error::capacity(format!(
                                    "block at {bx},{by} falls outside the {} reserved units",
                                    units.len()
                                )));
                            };
                            unit[start..start + 64].copy_from_slice(&block);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn decode_block(
        &self,
        bits: &mut BitStream<'_>,
        dc_table: u8,
        ac_table: u8,
        predictor: &mut i32,
        block: &mut [i16; 64],
    ) -> Result<()> {
        let table = |index: u8| {
            self.huffman_tables[usize::from(index)]
                .as_ref()
                .ok_or_else(|| Error::from("scan uses undefined huffman table"))
        };
        let dc = table(dc_table)?;
        let ac = table(2 | ac_table)?;

        *block = [0; 64];

        let size = dc.decode(bits)?;
        if size > 11 {
            return Err(Error::from(format!("invalid DC coefficient size {size}")));
        }
        block[0] = predict_dc(predictor, extend(bits.receive(size.into()), size))?;

        let mut k = 1;
        while k < 64 {
            let rs = ac.decode(bits)?;
            let (run, size) = (usize::from(rs >> 4), rs & 0xf);
            if size == 0 {
                if run == 15 {
                    k += 16;
                    continue;
                }
                break; // EOB
            }
            k += run;
            if k > 63 {
                return Err(Error::from("AC coefficient index out of range"));
            }
            block[usize::from(ZIGZAG[k])] = extend(bits.receive(size.into()), size) as i16;
            k += 1;
        }

        Ok(())
    }
}

/// Validates the frame's component layout and returns the image header and the component ids.
fn frame_components(sof: &FrameHeader) -> Result<(ImageHeader, Vec<u8>)> {
    let components = &sof.components[..];
    let (luma, chroma) = match components {
        [luma] => (luma, &[][..]),
        [luma, chroma @ ..] if chroma.len() == 2 => (luma, chroma),
        _ => {
            return Err(Error::from(format!(
                "frame with {} components not supported (only 1 or 3)",
                components.len()
            )))
        }
    };
    if let Some(c) = components.iter().find(|c| c.qtable > 3) {
        return Err(Error::from(format!(
            "component {} selects invalid quantization table {}",
            c.id, c.qtable
        )));
    }
    if !chroma.is_empty() && !matches!((luma.h_sampling, luma.v_sampling), (1 | 2, 1 | 2)) {
        return Err(Error::from(format!(
            "invalid sampling factors {}x{} for Y component",
            luma.h_sampling, luma.v_sampling
        )));
    }
    if let Some(c) = chroma.iter().find(|c| (c.h_sampling, c.v_sampling) != (1, 1)) {
        return Err(Error::from(format!(
            "invalid chroma sampling factors {}x{}",
            c.h_sampling, c.v_sampling
        )));
    }

    // A single-component scan is never interleaved: one block per MCU.
    let single = chroma.is_empty();
    let infos = components
        .iter()
        .map(|c| ComponentInfo {
            h_sampling: if single { 1 } else { c.h_sampling.into() },
            v_sampling: if single { 1 } else { c.v_sampling.into() },
            qtable: c.qtable.into(),
        })
        .collect();
    let header = ImageHeader::new(sof.width.into(), sof.height.into(), infos);
    Ok((header, components.iter().map(|c| c.id).collect()))
}

/// Sign-extends a `size`-bit magnitude category value (F.2.2.1 `EXTEND`).
fn extend(value: u32, size: u8) -> i32 {
    if size == 0 {
        return 0;
    }
    let value = value as i32;
    if value < 1 << (size - 1) {
        value - (1 << size) + 1
    } else {
        value
    }
}

/// Adds a DC difference to a component's predictor and returns the new DC coefficient.
fn predict_dc(predictor: &mut i32, diff: i32) -> Result<i16> {
    let dc = predictor
        .checked_add(diff)
        .and_then(|dc| i16::try_from(dc).ok())
        .ok_or_else(|| Error::from("DC coefficient out of range"))?;
    *predictor = dc.into();
    Ok(dc)
}

/// Baseline JPEG front-end decoding on the host.
#[derive(Default)]
pub struct JpegFrontEnd {
    scan: ScanBuffer,
}

impl JpegFrontEnd {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrontEnd for JpegFrontEnd {
    type Image = JpegImage;

    fn parse(&mut self, path: &Path) -> Result<JpegImage> {
        let jpeg = fs::read(path).map_err(Error::from)?;
        JpegImage::new(&jpeg)
    }

    fn header<'a>(&self, image: &'a JpegImage) -> &'a ImageHeader {
        &image.header
    }

    fn fill_coefficients(
        &mut self,
        image: &JpegImage,
        units: &mut [CoefficientBuffer],
        unit_offset: usize,
        capacity: UnitCapacity,
    ) -> Result<()> {
        let needed = image.header.units_needed(capacity);
        let Some(target) = units.get_mut(unit_offset..unit_offset + needed) else {
            return Err(Error::capacity(format!(
                "image needs units {}..{}, but only {} exist",
                unit_offset,
                unit_offset + needed,
                units.len()
            )));
        };
        image.decode_into(&mut self.scan, target, capacity)
    }
}
