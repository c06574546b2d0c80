//! Splitting entropy-coded scan data into restart intervals.
//!
//! Every interval is unstuffed (`FF 00` becomes `FF`) and stored in its own run of `u32` words, so
//! each one can be read by a separate [`BitStream`](crate::bits::BitStream). Unused bytes in an
//! interval's last word are zero. `RSTn` markers are dropped.

use crate::error::{Error, Result};

#[derive(Default)]
pub struct ScanBuffer {
    words: Vec<u32>,
    /// First word of every interval.
    starts: Vec<usize>,
    /// Unstuffed bytes of the interval being collected.
    pending: Vec<u8>,
}

impl ScanBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interval_count(&self) -> usize {
        self.starts.len()
    }

    pub fn interval(&self, index: usize) -> &[u32] {
        let end = self
            .starts
            .get(index + 1)
            .copied()
            .unwrap_or(self.words.len());
        &self.words[self.starts[index]..end]
    }

    /// Splits `data` and checks that it contains exactly `expected_intervals` intervals.
    pub fn process(&mut self, data: &[u8], expected_intervals: u32) -> Result<()> {
        self.words.clear();
        self.starts.clear();

        let mut rest = Some(data);
        while let Some(data) = rest {
            self.pending.clear();
            rest = unstuff(data, &mut self.pending)?;

            self.starts.push(self.words.len());
            self.pending.resize((self.pending.len() + 3) & !3, 0);
            self.words.extend(
                self.pending
                    .chunks_exact(4)
                    .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
            );
        }

        if self.starts.len() != expected_intervals as usize {
            return Err(Error::from(format!(
                "found {} restart intervals in scan data, expected {}",
                self.starts.len(),
                expected_intervals
            )));
        }
        Ok(())
    }
}

/// Copies one interval from `data` to `out`, returning the data after its `RSTn` marker, or `None`
/// if the interval ran to the end.
fn unstuff<'a>(mut data: &'a [u8], out: &mut Vec<u8>) -> Result<Option<&'a [u8]>> {
    while let Some(ff) = data.iter().position(|&b| b == 0xFF) {
        out.extend_from_slice(&data[..ff]);
        let Some(&marker) = data.get(ff + 1) else {
            // Trailing lone `FF`.
            return Ok(None);
        };
        data = &data[ff + 2..];
        match marker {
            0x00 => out.push(0xFF),
            0xD0..=0xD7 => return Ok(Some(data)),
            _ => {
                return Err(Error::from(format!(
                    "unexpected marker FF {marker:02X} in scan data"
                )))
            }
        }
    }
    out.extend_from_slice(data);
    Ok(None)
}
