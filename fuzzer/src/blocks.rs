// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Parse one hexadecimal value, tolerating surrounding whitespace and an
/// optional `0x` prefix.
pub fn parse_hex(text: &str) -> Result<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);

    let value = u64::from_str_radix(digits, 16)
        .with_context(|| format!("malformed hex value: {:?}", text))?;

    Ok(value)
}

/// Read a newline-delimited list of basic-block offsets. Each offset is added
/// to the configured base address to form an absolute breakpoint address.
/// Blank lines are tolerated; malformed lines are fatal.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<u64>> {
    let path = path.as_ref();

    let text = fs::read_to_string(path)
        .with_context(|| format!("reading block file {}", path.display()))?;

    parse(&text).with_context(|| format!("parsing block file {}", path.display()))
}

pub fn parse(text: &str) -> Result<Vec<u64>> {
    let mut offsets = Vec::new();

    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let offset = parse_hex(line).with_context(|| format!("error at line {}", index + 1))?;
        offsets.push(offset);
    }

    Ok(offsets)
}
