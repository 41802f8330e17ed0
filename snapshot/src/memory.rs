// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{Context, Result};
use libc::user_regs_struct;
use pete::Tracee;
use procfs::process::{MMapPath, MemoryMap, Process};

use crate::egg;

/// A writable mapping of the child, with its captured contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub name: String,
    pub data: Vec<u8>,
}

impl MemoryRegion {
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// The register file plus the byte-exact contents of every writable region,
/// captured at a chosen program-counter site. Created once per child, then
/// read repeatedly to rewind it.
#[derive(Clone)]
pub struct Snapshot {
    pub registers: user_regs_struct,
    pub regions: Vec<MemoryRegion>,
}

impl Snapshot {
    /// Capture the stopped tracee: every mapping whose permission string
    /// includes write, plus the full register file.
    ///
    /// Non-writable regions (code, read-only data, vdso text) cannot have
    /// been mutated by the child, and skipping them preserves breakpoint
    /// patches in the text segment across restores.
    pub fn capture(tracee: &mut Tracee) -> Result<Self> {
        let proc = Process::new(tracee.pid.as_raw()).context("opening procinfo for tracee")?;

        let mut regions = Vec::new();

        for map in proc.maps().context("reading memory maps for tracee")? {
            if !map.perms.contains('w') {
                continue;
            }

            let (start, end) = map.address;
            let name = region_name(&map);

            let data = tracee
                .read_memory(start, (end - start) as usize)
                .with_context(|| format!("capturing region {} at {:x}-{:x}", name, start, end))?;

            regions.push(MemoryRegion {
                start,
                end,
                name,
                data,
            });
        }

        let registers = tracee.registers().context("capturing register file")?;

        debug!("captured {} writable regions", regions.len());

        Ok(Self { registers, regions })
    }

    /// Rewind the tracee to the captured state: the register file first, then
    /// every region in capture order. Regions are disjoint, so the order is
    /// immaterial for correctness.
    pub fn restore(&self, tracee: &mut Tracee) -> Result<()> {
        tracee
            .set_registers(self.registers)
            .context("restoring register file")?;

        for region in &self.regions {
            tracee
                .write_memory(region.start, &region.data)
                .with_context(|| {
                    format!(
                        "restoring region {} at {:x}-{:x}",
                        region.name, region.start, region.end
                    )
                })?;
        }

        Ok(())
    }

    /// Look up a captured region by name, e.g. `[stack]` or `[heap]`.
    pub fn find_region(&self, name: &str) -> Option<&MemoryRegion> {
        self.regions.iter().find(|region| region.name == name)
    }

    /// Absolute addresses of every copy of the egg in the captured regions.
    pub fn locate_egg(&self, egg: &[u8]) -> Result<Vec<u64>> {
        egg::locate(&self.regions, egg)
    }
}

fn region_name(map: &MemoryMap) -> String {
    match &map.pathname {
        MMapPath::Path(path) => path.display().to_string(),
        MMapPath::Heap => "[heap]".to_string(),
        MMapPath::Stack => "[stack]".to_string(),
        MMapPath::TStack(tid) => format!("[stack:{}]", tid),
        MMapPath::Vdso => "[vdso]".to_string(),
        MMapPath::Vvar => "[vvar]".to_string(),
        MMapPath::Vsyscall => "[vsyscall]".to_string(),
        MMapPath::Anonymous => "Anonymous".to_string(),
        other => format!("{:?}", other),
    }
}
