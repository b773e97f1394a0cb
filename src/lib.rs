//! A post-mortem analyzer for the Windows user-mode heap.
//!
//! Given a debugger session attached to a live process or a crash dump,
//! the analyzer walks every heap owned by the target process (the
//! back-end segment lists, the low-fragmentation front end and the
//! virtual-alloc list, or the page-heap verifier's shadow list),
//! decodes the obfuscated per-block headers, correlates each allocated
//! block with the stack-trace record that produced it, and feeds the
//! resulting stream of [`AllocationRecord`]s into an aggregating
//! [`Processor`].
//!
//! The debugger host implements [`Target`] (typed reads of the
//! debuggee's address space plus symbolic lookups) and hands command
//! lines to [`command::run`]:
//!
//! - `heapstat [-v] [-k <key>]`: by-caller summary
//! - `bysize [-v] [<size>]`: by-size summary
//! - `umdh [-crlf] <file>`: a diff-friendly UMDH-format report
//! - `ust <addr>`: one stack-trace record, symbolized
//!
//! The analyzer only reads the target's address space; it never
//! allocates there, does not reconstruct freed blocks and does not
//! follow pointers into user payloads.

#[macro_use]
mod macros;

pub mod command;
pub mod env;
pub mod error;
pub mod heap;
pub mod processor;
pub mod target;
pub mod ust;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::env::{Bitness, Mode, OsVersion, TargetEnv};
pub use crate::error::{Error, Result};
pub use crate::heap::{WalkOptions, Walker};
pub use crate::processor::{
    AllocationRecord, BySizeProcessor, LineEnding, Processor, SummaryProcessor, UmdhProcessor,
};
pub use crate::target::{Module, Symbol, Target};
