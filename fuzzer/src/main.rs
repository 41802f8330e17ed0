// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use fuzzer::blocks;
use fuzzer::corpus::DirCorpus;
use fuzzer::session::{Config, Session};

/// Coverage-guided snapshot fuzzer for Linux x86-64 targets.
#[derive(Parser, Debug)]
struct Args {
    /// Load address of the target's text segment, in hex.
    #[arg(long, value_parser = parse_hex_arg)]
    base_address: u64,

    /// File listing one basic-block offset per line, in hex.
    #[arg(long)]
    blocks: PathBuf,

    /// Directory of seed inputs; grows as new coverage is found.
    #[arg(long)]
    corpus: PathBuf,

    /// Directory crashing inputs are recorded into.
    #[arg(long)]
    crashes: PathBuf,

    /// Absolute address to snapshot at; requires --restore-address.
    #[arg(long, value_parser = parse_hex_arg)]
    snapshot_address: Option<u64>,

    /// Absolute address that ends an iteration and rewinds the child.
    #[arg(long, value_parser = parse_hex_arg)]
    restore_address: Option<u64>,

    /// RNG seed, for reproducible runs.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Stop after this many fuzz cases; fuzz until interrupted by default.
    #[arg(long)]
    iterations: Option<u64>,

    /// Path of the target executable.
    target: PathBuf,
}

fn parse_hex_arg(text: &str) -> Result<u64, String> {
    blocks::parse_hex(text).map_err(|err| err.to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::init();

    let corpus = DirCorpus::load(&args.corpus, &args.crashes)?;

    let config = Config {
        target: args.target,
        base_address: args.base_address,
        blocks: args.blocks,
        snapshot_address: args.snapshot_address,
        restore_address: args.restore_address,
        seed: args.seed,
        iterations: args.iterations,
    };

    let mut session = Session::new(config, corpus)?;

    session.run()
}
