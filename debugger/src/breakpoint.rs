// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::target::Target;

const INT3: u8 = 0xcc;

/// Software breakpoints keyed by absolute address, each saving the original
/// instruction byte clobbered by `int3`.
///
/// An address is present iff a `0xcc` is currently written at that address in
/// the child. Retiring an entry consumes it, so a site contributes to `hits`
/// at most once for the lifetime of the table.
#[derive(Clone, Debug, Default)]
pub struct BreakpointTable {
    saved: BTreeMap<u64, u8>,
    total: usize,
    hits: usize,
}

impl BreakpointTable {
    pub fn install(&mut self, target: &mut Target, addr: u64) -> Result<()> {
        // Return if the breakpoint exists. We don't want to conclude that the
        // saved instruction byte was `0xcc`.
        if self.saved.contains_key(&addr) {
            return Ok(());
        }

        let data = target.read_memory(addr, 1)?;
        self.saved.insert(addr, data[0]);
        target
            .write_memory(addr, &[INT3])
            .context("installing breakpoint, writing int3")?;
        self.total += 1;

        Ok(())
    }

    /// Restore the original byte at `addr` and delete the entry, so the site
    /// never traps again. Returns false when no breakpoint is installed at
    /// `addr`; the caller decides whether that is fatal.
    pub fn retire(&mut self, target: &mut Target, addr: u64) -> Result<bool> {
        let data = self.saved.remove(&addr);

        let retired = if let Some(data) = data {
            target
                .write_memory(addr, &[data])
                .context("retiring breakpoint, restoring byte")?;
            self.hits += 1;
            true
        } else {
            false
        };

        Ok(retired)
    }

    /// Re-poke `int3` at every live entry without touching the saved bytes.
    ///
    /// A snapshot restore can overwrite patched text that happens to fall in
    /// a writable segment, and a freshly spawned child of the same binary
    /// starts with original bytes at every site. Both cases are repaired by
    /// re-arming the live set.
    pub fn reinstall_all(&mut self, target: &mut Target) -> Result<()> {
        for &addr in self.saved.keys() {
            target
                .write_memory(addr, &[INT3])
                .with_context(|| format!("re-arming breakpoint at {:x}", addr))?;
        }

        Ok(())
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.saved.contains_key(&addr)
    }

    /// Count of addresses ever installed.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Count of retired (hit) addresses. Monotone, bounded by `total`.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Count of live, not-yet-hit entries.
    pub fn remaining(&self) -> usize {
        self.saved.len()
    }
}

/// A single control breakpoint, kept out of the coverage table. Used for the
/// snapshot and restore sites, which must never be counted as coverage.
#[derive(Clone, Debug)]
pub struct Breakpoint {
    addr: u64,
    saved: Option<u8>,
}

impl Breakpoint {
    pub fn new(addr: u64) -> Self {
        Self { addr, saved: None }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn is_set(&self) -> bool {
        self.saved.is_some()
    }

    pub fn set(&mut self, target: &mut Target) -> Result<()> {
        if self.saved.is_some() {
            return Ok(());
        }

        let data = target.read_memory(self.addr, 1)?;
        self.saved = Some(data[0]);
        target
            .write_memory(self.addr, &[INT3])
            .with_context(|| format!("setting breakpoint at {:x}", self.addr))?;

        Ok(())
    }

    pub fn clear(&mut self, target: &mut Target) -> Result<()> {
        if let Some(data) = self.saved.take() {
            target
                .write_memory(self.addr, &[data])
                .with_context(|| format!("clearing breakpoint at {:x}", self.addr))?;
        }

        Ok(())
    }

    /// Put the trap back without re-reading the original byte.
    pub fn rearm(&mut self, target: &mut Target) -> Result<()> {
        if self.saved.is_some() {
            target
                .write_memory(self.addr, &[INT3])
                .with_context(|| format!("re-arming breakpoint at {:x}", self.addr))?;
        }

        Ok(())
    }
}
