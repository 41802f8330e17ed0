// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate log;

pub mod blocks;
pub mod corpus;
pub mod mutator;
pub mod session;

pub use corpus::{Corpus, DirCorpus};
pub use session::{Config, Session};
