// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate log;

pub mod breakpoint;
pub mod target;

pub use breakpoint::{Breakpoint, BreakpointTable};
pub use target::{Target, WaitOutcome};

pub use libc::user_regs_struct;
pub use pete::Signal;
