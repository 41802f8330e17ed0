// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Number of perturbations applied per case: 5% of the buffer, at least one.
fn rounds(len: usize) -> usize {
    std::cmp::max(1, len / 20)
}

/// Bounded random byte-level perturbations, applied in place.
///
/// The caller copies the selected corpus entry into a working buffer before
/// mutating, so corpus entries themselves are never touched.
pub struct Mutator {
    rng: StdRng,
}

impl Mutator {
    pub fn new(seed: u64) -> Self {
        let rng = StdRng::seed_from_u64(seed);

        Self { rng }
    }

    pub fn mutate(&mut self, case: &mut [u8]) {
        if case.is_empty() {
            return;
        }

        for _ in 0..rounds(case.len()) {
            let index = self.rng.gen_range(0..case.len());

            // Edits may collide; distinct edits are not guaranteed.
            match self.rng.gen_range(0..6) {
                0 => case[index] ^= 1 << self.rng.gen_range(0..8),
                1 => case[index] ^= self.rng.gen::<u8>(),
                2 => case[index] = self.rng.gen::<u8>(),
                3 => case[index] = 0x00,
                4 => case[index] = 0xff,
                _ => {}
            }
        }
    }

    /// Uniform pick of a corpus index.
    pub fn pick(&mut self, count: usize) -> usize {
        self.rng.gen_range(0..count)
    }
}
