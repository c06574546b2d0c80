/// MSB-first bit reader over one restart interval of a [`crate::scan::ScanBuffer`].
///
/// The interval's bytes are stored in memory order, four per word. Once the words run out the
/// reader keeps producing zero bits.
pub struct BitStream<'a> {
    words: &'a [u32],
    /// Unconsumed bits, aligned to the most significant bit.
    acc: u64,
    /// Number of valid bits in `acc`.
    avail: u32,
}

impl<'a> BitStream<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        let mut bits = Self {
            words,
            acc: 0,
            avail: 0,
        };
        bits.refill();
        bits
    }

    /// Tops the accumulator up to more than 32 bits.
    #[inline]
    pub fn refill(&mut self) {
        while self.avail <= 32 {
            let word = match self.words {
                [first, rest @ ..] => {
                    self.words = rest;
                    u32::from_be(*first)
                }
                [] => 0,
            };
            self.acc |= u64::from(word) << (32 - self.avail);
            self.avail += 32;
        }
    }

    /// Returns the next `n` bits without consuming them. Requires `n <= avail`.
    #[inline]
    pub fn peek(&self, n: u32) -> u32 {
        debug_assert!((1..=32).contains(&n) && n <= self.avail);
        (self.acc >> (64 - n)) as u32
    }

    #[inline]
    pub fn consume(&mut self, n: u32) {
        debug_assert!(n <= self.avail);
        self.acc <<= n;
        self.avail -= n;
    }

    /// Reads an `n`-bit unsigned value, `n` in `0..=16`.
    pub fn receive(&mut self, n: u32) -> u32 {
        if n == 0 {
            return 0;
        }
        self.refill();
        let value = self.peek(n);
        self.consume(n);
        value
    }
}
