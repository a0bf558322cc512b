//! Small-state deterministic PRNG backing the recording bit stream.
//!
//! This is Bob Jenkins' jsf64: four 64-bit lanes updated with
//! rotate-and-add steps. It is fast, has a period far beyond 2^64, and is
//! reproducible bit-for-bit from a single seed, which is all the engine
//! needs — every test case is identified by its seed alone.

use rand::RngCore;

const INIT_SALT: u64 = 0xf1ea5eed;
const INIT_ROUNDS: usize = 20;

/// Jenkins small fast generator, 64-bit variant.
#[derive(Debug, Clone)]
pub struct Jsf64 {
    a: u64,
    b: u64,
    c: u64,
    d: u64,
}

impl Jsf64 {
    pub fn new(seed: u64) -> Jsf64 {
        let mut rng = Jsf64 {
            a: INIT_SALT,
            b: seed,
            c: seed,
            d: seed,
        };
        for _ in 0..INIT_ROUNDS {
            rng.next();
        }
        rng
    }

    #[inline]
    pub fn next(&mut self) -> u64 {
        let e = self.a.wrapping_sub(self.b.rotate_left(7));
        self.a = self.b ^ self.c.rotate_left(13);
        self.b = self.c.wrapping_add(self.d.rotate_left(37));
        self.c = self.d.wrapping_add(e);
        self.d = e.wrapping_add(self.a);
        self.d
    }
}

impl RngCore for Jsf64 {
    fn next_u32(&mut self) -> u32 {
        self.next() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
