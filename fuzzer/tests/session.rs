// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use fuzzer::corpus::{Corpus, DirCorpus};
use fuzzer::session::{Config, Session};

fn compile(dir: &Path, name: &str, source: &str) -> Result<PathBuf> {
    let source_path = dir.join(format!("{}.c", name));
    fs::write(&source_path, source)?;

    let binary = dir.join(name);

    // Breakpoint addresses come from the ELF, so the image must load at its
    // preferred base.
    let output = Command::new("cc")
        .arg("-O0")
        .arg("-no-pie")
        .arg("-o")
        .arg(&binary)
        .arg(&source_path)
        .output()
        .context("running cc")?;

    if !output.status.success() {
        bail!("cc failed: {}", String::from_utf8_lossy(&output.stderr));
    }

    Ok(binary)
}

fn entry_point(binary: &Path) -> Result<u64> {
    let data = fs::read(binary)?;
    let object = goblin::elf::Elf::parse(&data)?;

    Ok(object.entry)
}

fn function_va(binary: &Path, name: &str) -> Result<u64> {
    let data = fs::read(binary)?;
    let object = goblin::elf::Elf::parse(&data)?;

    for sym in object.syms.iter() {
        if !sym.is_function() {
            continue;
        }

        // For executables, `st_value` holds the VA of the symbol.
        if object.strtab.get_at(sym.st_name) == Some(name) {
            return Ok(sym.st_value);
        }
    }

    bail!("function {} not found in {}", name, binary.display());
}

fn seed_corpus(dir: &Path, seed: &[u8]) -> Result<(PathBuf, PathBuf)> {
    let corpus_dir = dir.join("corpus");
    let crash_dir = dir.join("crashes");

    fs::create_dir(&corpus_dir)?;
    fs::write(corpus_dir.join("seed.bin"), seed)?;

    Ok((corpus_dir, crash_dir))
}

fn write_blocks(dir: &Path, addresses: &[u64]) -> Result<PathBuf> {
    let path = dir.join("blocks.txt");

    let mut text = String::new();
    for addr in addresses {
        text.push_str(&format!("{:x}\n", addr));
    }
    fs::write(&path, text)?;

    Ok(path)
}

#[test]
fn spawn_mode_counts_coverage_once() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let target = compile(dir.path(), "exit-zero", "int main(void) { return 0; }\n")?;
    let (corpus_dir, crash_dir) = seed_corpus(dir.path(), b"AAAAAAAA")?;

    // The entry point runs in every child.
    let blocks = write_blocks(dir.path(), &[entry_point(&target)?])?;

    let config = Config {
        target,
        base_address: 0,
        blocks,
        snapshot_address: None,
        restore_address: None,
        seed: 0x1234,
        iterations: Some(10),
    };

    let mut session = Session::new(config, DirCorpus::load(&corpus_dir, &crash_dir)?)?;
    session.run()?;

    // Ten children each executed the block; only the first one counted.
    assert_eq!(session.coverage(), (1, 1));
    assert_eq!(session.stats().fuzz_cases, 10);
    assert_eq!(session.stats().crashes, 0);

    // Only the first new-coverage case was promoted.
    assert_eq!(session.corpus().count(), 2);

    Ok(())
}

// Faults iff the input byte was perturbed.
const CRASH_TARGET: &str = r#"
#include <stdio.h>

int main(int argc, char **argv) {
    FILE *f;
    char c = 0;

    if (argc < 2)
        return 1;

    f = fopen(argv[1], "rb");
    if (!f)
        return 1;

    fread(&c, 1, 1, f);
    fclose(f);

    if (c != 'B')
        *(volatile int *)0 = 1;

    return 0;
}
"#;

#[test]
fn spawn_mode_records_crashes() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let target = compile(dir.path(), "null-deref", CRASH_TARGET)?;
    let (corpus_dir, crash_dir) = seed_corpus(dir.path(), b"B")?;

    let blocks = write_blocks(dir.path(), &[entry_point(&target)?])?;

    let config = Config {
        target,
        base_address: 0,
        blocks,
        snapshot_address: None,
        restore_address: None,
        seed: 0x1234,
        iterations: Some(50),
    };

    let mut session = Session::new(config, DirCorpus::load(&corpus_dir, &crash_dir)?)?;
    session.run()?;

    assert!(session.stats().crashes > 0);

    // Every recorded crash holds a perturbed input byte.
    let mut crash_files = 0;
    for entry in fs::read_dir(&crash_dir)? {
        let case = fs::read(entry?.path())?;
        assert_ne!(case[0], b'B');
        crash_files += 1;
    }
    assert!(crash_files > 0);

    Ok(())
}

// Reads its input into a global, passes the snapshot site, executes one
// instrumented block, and exits without ever reaching `finished`. Every run
// is lost, forcing the session to respawn and re-attach.
const EARLY_EXIT_TARGET: &str = r#"
#include <stdio.h>

char input[32];

void __attribute__((noinline)) block_a(void) { __asm__ volatile(""); }
void __attribute__((noinline)) checkpoint(void) { __asm__ volatile(""); }
void __attribute__((noinline)) finished(void) { __asm__ volatile(""); }

int main(int argc, char **argv) {
    FILE *f;

    if (argc < 2)
        return 1;

    f = fopen(argv[1], "rb");
    if (!f)
        return 1;

    fread(input, 1, sizeof input, f);
    fclose(f);

    checkpoint();
    block_a();

    return 0;
}
"#;

#[test]
fn snapshot_mode_keeps_coverage_once_across_respawns() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let target = compile(dir.path(), "early-exit", EARLY_EXIT_TARGET)?;
    let (corpus_dir, crash_dir) = seed_corpus(dir.path(), &[b'X'; 32])?;

    let blocks = write_blocks(dir.path(), &[function_va(&target, "block_a")?])?;

    let config = Config {
        target: target.clone(),
        base_address: 0,
        blocks,
        snapshot_address: Some(function_va(&target, "checkpoint")?),
        restore_address: Some(function_va(&target, "finished")?),
        seed: 0x1234,
        iterations: None,
    };

    let mut session = Session::new(config, DirCorpus::load(&corpus_dir, &crash_dir)?)?;

    // The restore point is never reached, so the session respawns the child
    // until it gives up on the run.
    assert!(session.run().is_err());

    // The instrumented block ran in every child's life, but it was retired in
    // the first one and must stay retired across every re-attach.
    assert_eq!(session.coverage(), (1, 1));
    assert_eq!(session.stats().crashes, 0);
    assert_eq!(session.corpus().count(), 1);

    Ok(())
}
