//! Deterministic seeded random number generator.
//!
//! Every peer seeds the generator with the same value at game start and
//! draws from it in the same order, so "random" gameplay outcomes such as
//! building scan delays never have to be transmitted. The generator has no
//! other entropy source: no wall clock, no OS randomness.

use serde::{Deserialize, Serialize};

/// Serializable generator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RngState {
    /// Seed the generator was last reset with.
    pub seed: u64,
    /// Internal xorshift state.
    pub state: u64,
    /// Number of values drawn since the last reset.
    pub draws: u64,
}

/// Xorshift64* generator with splitmix64 seeding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeterministicRng {
    seed: u64,
    state: u64,
    draws: u64,
}

impl DeterministicRng {
    /// Create a generator from a seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        let mut rng = Self {
            seed: 0,
            state: 1,
            draws: 0,
        };
        rng.seed(seed);
        rng
    }

    /// Reset the generator and draw counter.
    pub fn seed(&mut self, seed: u64) {
        self.seed = seed;
        self.state = splitmix64(seed);
        // xorshift never leaves the all-zero state
        if self.state == 0 {
            self.state = 0x9E37_79B9_7F4A_7C15;
        }
        self.draws = 0;
    }

    /// Next raw 64-bit value.
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        self.draws += 1;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Value in `[low, high)`.
    ///
    /// An empty range returns `low` without consuming a draw.
    pub fn next_int(&mut self, low: i32, high: i32) -> i32 {
        if low >= high {
            return low;
        }
        let range = (i64::from(high) - i64::from(low)) as u64;
        let upper = self.next_u64() >> 32;
        let offset = (upper * range) >> 32;
        (i64::from(low) + offset as i64) as i32
    }

    /// Seed the generator was last reset with.
    #[must_use]
    pub const fn initial_seed(&self) -> u64 {
        self.seed
    }

    /// Values drawn since the last reset.
    #[must_use]
    pub const fn draws(&self) -> u64 {
        self.draws
    }

    /// Capture the full state.
    #[must_use]
    pub const fn snapshot(&self) -> RngState {
        RngState {
            seed: self.seed,
            state: self.state,
            draws: self.draws,
        }
    }

    /// Rebuild a generator from a snapshot.
    #[must_use]
    pub const fn restore(state: RngState) -> Self {
        Self {
            seed: state.seed,
            state: state.state,
            draws: state.draws,
        }
    }
}

fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
