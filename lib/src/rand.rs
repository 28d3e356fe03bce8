//! Per-worker pseudo random numbers.
//!
//! Steal-partner selection only needs decorrelated sequences, not quality
//! randomness, so an xorshift64* generator is plenty and costs three shifts
//! per draw.

use crate::clock::monotonic_ns;

pub struct WorkerRng {
    state: u64,
}

impl WorkerRng {
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E3779B97F4A7C15 } else { seed },
        }
    }

    /// Seed from the clock and a caller-provided salt (e.g. worker index).
    pub fn seeded(salt: u64) -> Self {
        Self::new(monotonic_ns() ^ salt.wrapping_mul(0xA24BAED4963EE407))
    }

    #[inline]
    pub fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform-ish draw in `[0, n)`. `n` must be non-zero.
    #[inline]
    pub fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }

    /// Random odd number, handy as a coprime stride over a power-of-two or
    /// small table.
    #[inline]
    pub fn odd(&mut self) -> u64 {
        self.next() | 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_differ_by_seed() {
        let mut a = WorkerRng::new(1);
        let mut b = WorkerRng::new(2);
        let va: Vec<u64> = (0..8).map(|_| a.next()).collect();
        let vb: Vec<u64> = (0..8).map(|_| b.next()).collect();
        assert_ne!(va, vb);
    }

    #[test]
    fn below_stays_in_range() {
        let mut rng = WorkerRng::new(42);
        for _ in 0..1000 {
            assert!(rng.below(7) < 7);
        }
    }
}
