// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate log;

pub mod egg;
pub mod memory;

pub use memory::{MemoryRegion, Snapshot};
