//! Canonical huffman codes (JPEG Annex C) and table-driven symbol decoding.

use std::fmt;

use crate::{
    bits::BitStream,
    error::{Error, Result},
};

/// Longest code length allowed by JPEG.
const MAX_LEN: usize = 16;

/// The codes of one huffman table, in the order they are assigned.
pub struct CanonicalCodes {
    codes: Vec<Code>,
}

#[derive(Clone, Copy)]
struct Code {
    /// Right-aligned code bits.
    bits: u16,
    /// 0 for entries of the lookup table that no code maps to.
    len: u8,
    symbol: u8,
}

impl Code {
    const UNASSIGNED: Self = Self {
        bits: 0,
        len: 0,
        symbol: 0,
    };
}

impl CanonicalCodes {
    /// Assigns codes to `symbols` given the number of codes of each length (1 to 16 bits).
    pub fn new(counts: &[u8; MAX_LEN], symbols: &[u8]) -> Result<Self> {
        let total: usize = counts.iter().map(|&n| usize::from(n)).sum();
        if symbols.len() < total {
            return Err(Error::from(format!(
                "huffman table defines {} codes but only {} symbols",
                total,
                symbols.len()
            )));
        }

        let mut codes = Vec::with_capacity(total);
        let mut symbols = symbols.iter().copied();
        let mut code = 0u32;
        for (len, &count) in (1..=MAX_LEN as u8).zip(counts) {
            for symbol in symbols.by_ref().take(count.into()) {
                if code >> len != 0 {
                    return Err(Error::from(format!(
                        "huffman table has too many codes of length {len}"
                    )));
                }
                codes.push(Code {
                    bits: code as u16,
                    len,
                    symbol,
                });
                code += 1;
            }
            code <<= 1;
        }
        Ok(Self { codes })
    }

    /// Builds a decoder that resolves a symbol from the next 16 bits of input in one lookup.
    pub fn decoder(&self) -> HuffmanLut {
        let mut table = vec![Code::UNASSIGNED; 1 << MAX_LEN];
        for code in &self.codes {
            // A code of length n owns every 16-bit pattern it prefixes.
            let free = MAX_LEN - usize::from(code.len);
            let first = usize::from(code.bits) << free;
            table[first..first + (1 << free)].fill(*code);
        }
        HuffmanLut { table }
    }
}

impl fmt::Debug for CanonicalCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.codes {
            let width = usize::from(c.len);
            writeln!(f, "{:0width$b} -> {:#04x}", c.bits, c.symbol)?;
        }
        Ok(())
    }
}

/// A huffman table ready for decoding.
#[derive(Clone)]
pub struct HuffmanLut {
    table: Vec<Code>,
}

impl HuffmanLut {
    /// Decodes one symbol from `bits`.
    pub fn decode(&self, bits: &mut BitStream<'_>) -> Result<u8> {
        bits.refill();
        let code = self.table[bits.peek(MAX_LEN as u32) as usize];
        if code.len == 0 {
            return Err(Error::from("invalid huffman code in scan data"));
        }
        bits.consume(code.len.into());
        Ok(code.symbol)
    }
}

impl fmt::Debug for HuffmanLut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mapped = self.table.iter().filter(|c| c.len != 0).count();
        write!(f, "HuffmanLut({mapped} of {} patterns)", self.table.len())
    }
}
