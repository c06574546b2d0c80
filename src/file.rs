//! Marker-level reader for baseline JPEG streams.
//!
//! Splits a JPEG file into its marker segments and decodes the handful of segments the front-end
//! needs into owned headers. Entropy-coded data is returned as a borrowed slice.


use std::fmt;

use crate::error::{Error, Result};

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const DQT: u8 = 0xDB;
const DRI: u8 = 0xDD;
const DHT: u8 = 0xC4;

/// Iterates over the segments of a JPEG stream, up to the `EOI` marker.
///
/// Yields `Err` at most once; the iterator is fused after an error or `EOI`.
pub struct Segments<'a> {
    cursor: Cursor<'a>,
    done: bool,
}

impl<'a> Segments<'a> {
    pub fn new(jpeg: &'a [u8]) -> Result<Self> {
        if !jpeg.starts_with(&[0xFF, SOI]) {
            return Err(Error::from("missing SOI marker, not a JPEG file"));
        }
        Ok(Self {
            cursor: Cursor { buf: jpeg, pos: 2 },
            done: false,
        })
    }

    /// Bytes after the `EOI` marker (or after the point where reading stopped).
    pub fn trailing(&self) -> &'a [u8] {
        self.cursor.rest()
    }

    fn read(&mut self) -> Result<Option<Marked<'a>>> {
        // Garbage between segments is tolerated; fill bytes before a marker are skipped.
        while self.cursor.u8()? != 0xFF {}
        let offset = self.cursor.pos - 1;
        let marker = loop {
            match self.cursor.u8()? {
                0xFF => continue,
                m => break m,
            }
        };

        let segment = match marker {
            EOI => return Ok(None),
            0x00 => return Err(Error::from("stuffed 0xFF00 outside of scan data")),
            0xD0..=0xD7 => {
                return Err(Error::from(format!(
                    "restart marker RST{} outside of scan data",
                    marker & 7
                )))
            }
            _ => {
                let len = self.cursor.be16()?;
                if len < 2 {
                    return Err(Error::from(format!("segment length {len} is too small")));
                }
                let mut body = Cursor {
                    buf: self.cursor.take(usize::from(len) - 2)?,
                    pos: 0,
                };
                let segment = match marker {
                    DQT => Segment::QuantTables(quant_tables(&mut body)?),
                    DHT => Segment::HuffmanTables(huffman_tables(&mut body)?),
                    DRI => Segment::RestartInterval(body.be16()?),
                    0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                        Segment::Frame(frame_header(marker, &mut body)?)
                    }
                    SOS => {
                        let header = scan_header(&mut body)?;
                        let data = self.cursor.entropy_coded()?;
                        Segment::Scan(header.with_data(data))
                    }
                    _ => {
                        log::trace!("ignoring marker FF {marker:02X} ({len} bytes)");
                        body.pos = body.buf.len();
                        Segment::Ignored
                    }
                };
                if !body.rest().is_empty() {
                    log::warn!(
                        "{} unused bytes at the end of FF {:02X} segment",
                        body.rest().len(),
                        marker
                    );
                }
                segment
            }
        };

        Ok(Some(Marked {
            offset,
            marker,
            segment,
        }))
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = Result<Marked<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.read().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn truncated() -> Error {
        Error::from("unexpected end of JPEG data")
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn u8(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or_else(Self::truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn nibbles(&mut self) -> Result<(u8, u8)> {
        let b = self.u8()?;
        Ok((b >> 4, b & 0xF))
    }

    fn be16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self.rest().get(..n).ok_or_else(Self::truncated)?;
        self.pos += n;
        Ok(bytes)
    }

    /// Consumes entropy-coded data up to the first marker that is not `FF 00` or `RSTn`.
    fn entropy_coded(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        loop {
            let ff = self.rest().iter().position(|&b| b == 0xFF);
            let Some(ff) = ff else {
                return Err(Self::truncated());
            };
            let mut next = self.pos + ff + 1;
            while self.buf.get(next) == Some(&0xFF) {
                next += 1;
            }
            match self.buf.get(next) {
                None => return Err(Self::truncated()),
                Some(0x00 | 0xD0..=0xD7) => self.pos = next + 1,
                Some(_) => {
                    self.pos = next - 1;
                    return Ok(&self.buf[start..self.pos]);
                }
            }
        }
    }
}

fn quant_tables(body: &mut Cursor<'_>) -> Result<Vec<QuantTable>> {
    let mut tables = Vec::new();
    while !body.rest().is_empty() {
        let (precision, dest) = body.nibbles()?;
        if precision != 0 {
            return Err(Error::from(format!(
                "16-bit quantization table {dest} is not supported"
            )));
        }
        let mut zigzag = [0; 64];
        zigzag.copy_from_slice(body.take(64)?);
        tables.push(QuantTable { dest, zigzag });
    }
    Ok(tables)
}

fn huffman_tables<'a>(body: &mut Cursor<'a>) -> Result<Vec<HuffmanSpec<'a>>> {
    let mut tables = Vec::new();
    while !body.rest().is_empty() {
        let (class, dest) = body.nibbles()?;
        let mut counts = [0; 16];
        counts.copy_from_slice(body.take(16)?);
        let total = counts.iter().map(|&n| usize::from(n)).sum();
        tables.push(HuffmanSpec {
            class,
            dest,
            counts,
            values: body.take(total)?,
        });
    }
    Ok(tables)
}

fn frame_header(marker: u8, body: &mut Cursor<'_>) -> Result<FrameHeader> {
    let precision = body.u8()?;
    let height = body.be16()?;
    let width = body.be16()?;
    let count = body.u8()?;
    let components = (0..count)
        .map(|_| {
            let id = body.u8()?;
            let (h_sampling, v_sampling) = body.nibbles()?;
            let qtable = body.u8()?;
            Ok(FrameComponent {
                id,
                h_sampling,
                v_sampling,
                qtable,
            })
        })
        .collect::<Result<_>>()?;
    Ok(FrameHeader {
        coding: Coding(marker),
        precision,
        height,
        width,
        components,
    })
}

fn scan_header<'a>(body: &mut Cursor<'a>) -> Result<ScanHeader<'a>> {
    let count = body.u8()?;
    let components = (0..count)
        .map(|_| {
            let selector = body.u8()?;
            let (dc_table, ac_table) = body.nibbles()?;
            Ok(ScanComponent {
                selector,
                dc_table,
                ac_table,
            })
        })
        .collect::<Result<_>>()?;
    let spectral = (body.u8()?, body.u8()?);
    let approximation = body.nibbles()?;
    Ok(ScanHeader {
        components,
        spectral,
        approximation,
        data: &[],
    })
}

/// A segment and the position of its marker.
#[derive(Debug)]
pub struct Marked<'a> {
    /// Offset of the `FF` byte introducing the marker.
    pub offset: usize,
    pub marker: u8,
    pub segment: Segment<'a>,
}

#[derive(Debug)]
pub enum Segment<'a> {
    Frame(FrameHeader),
    QuantTables(Vec<QuantTable>),
    HuffmanTables(Vec<HuffmanSpec<'a>>),
    /// MCUs between restart markers; 0 disables them.
    RestartInterval(u16),
    Scan(ScanHeader<'a>),
    /// Application data, comments and anything else not needed for decoding.
    Ignored,
}

/// The coding process selected by a frame's `SOFn` marker.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Coding(u8);

impl Coding {
    pub const BASELINE: Self = Self(0xC0);

    pub fn is_baseline(self) -> bool {
        self == Self::BASELINE
    }
}

impl fmt::Debug for Coding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0xC0 => "baseline",
            0xC1 => "extended sequential",
            0xC2 => "progressive",
            0xC3 => "lossless",
            0xC9..=0xCB => "arithmetic",
            _ => "hierarchical",
        };
        write!(f, "SOF{} ({})", self.0 & 0xF, name)
    }
}

#[derive(Debug)]
pub struct FrameHeader {
    pub coding: Coding,
    /// Bits per sample.
    pub precision: u8,
    pub height: u16,
    pub width: u16,
    pub components: Vec<FrameComponent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameComponent {
    pub id: u8,
    pub h_sampling: u8,
    pub v_sampling: u8,
    pub qtable: u8,
}

pub struct QuantTable {
    pub dest: u8,
    /// Quantizer values in zig-zag order.
    pub zigzag: [u8; 64],
}

impl fmt::Debug for QuantTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuantTable({}, dc={})", self.dest, self.zigzag[0])
    }
}

/// A huffman table as transmitted: code counts per length, then the symbols.
#[derive(Debug)]
pub struct HuffmanSpec<'a> {
    /// 0 for DC, 1 for AC.
    pub class: u8,
    pub dest: u8,
    pub counts: [u8; 16],
    pub values: &'a [u8],
}

pub struct ScanHeader<'a> {
    pub components: Vec<ScanComponent>,
    /// First and last coefficient index in zig-zag order.
    pub spectral: (u8, u8),
    /// Successive approximation bit positions (high, low).
    pub approximation: (u8, u8),
    /// Entropy-coded data, still byte-stuffed and with any `RSTn` markers.
    pub data: &'a [u8],
}

impl<'a> ScanHeader<'a> {
    fn with_data(self, data: &'a [u8]) -> Self {
        Self { data, ..self }
    }

    pub fn is_sequential(&self) -> bool {
        self.spectral == (0, 63) && self.approximation == (0, 0)
    }
}

impl fmt::Debug for ScanHeader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanHeader")
            .field("components", &self.components)
            .field("spectral", &self.spectral)
            .field("approximation", &self.approximation)
            .field("data", &format_args!("{} bytes", self.data.len()))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanComponent {
    pub selector: u8,
    pub dc_table: u8,
    pub ac_table: u8,
}
