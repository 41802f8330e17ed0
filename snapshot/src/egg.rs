// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{bail, Result};
use memchr::memmem;

use crate::memory::MemoryRegion;

/// Marker cycled to build an egg payload: the ASCII bytes of `DEADBEEF`.
pub const MARKER: [u8; 8] = *b"DEADBEEF";

/// Build an egg of exactly `len` bytes by cycling the marker.
pub fn pattern(len: usize) -> Vec<u8> {
    MARKER.iter().copied().cycle().take(len).collect()
}

/// Find every copy of the egg inside the captured regions, returning the
/// absolute address of each occurrence.
///
/// The target may copy its input several times (argument vector, read buffer,
/// parsed token). Overwriting only one copy leaves stale state in the others,
/// so every match matters.
pub fn locate(regions: &[MemoryRegion], egg: &[u8]) -> Result<Vec<u64>> {
    let mut found = Vec::new();

    for region in regions {
        for offset in memmem::find_iter(&region.data, egg) {
            found.push(region.start + offset as u64);
        }
    }

    if found.is_empty() {
        bail!("egg not found in any captured region");
    }

    Ok(found)
}
