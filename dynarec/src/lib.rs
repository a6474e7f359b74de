//! A block-based dynamic recompiler core.
//!
//! Guest code is analyzed one basic block at a time ([`analyzer`]), compiled by a guest
//! [`Frontend`] with the help of a register cache ([`regcache`]) into threaded bytecode
//! ([`bytecode`]), and kept in a [`BlockCache`] whose blocks exit directly into each other.
//! The [`Dispatcher`] drives it all against a cycle budget.

pub mod analyzer;
pub mod arch;
pub mod block;
pub mod block_cache;
pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod regcache;
pub mod regset;

#[cfg(test)]
mod testing;

pub use analyzer::{Analyzer, AnalyzerOptions};
pub use arch::{Architecture, FlagGroups, OpFlags, OpInfo};
pub use block::{BlockRegStats, CodeBlock, CodeOp};
pub use block_cache::{BlockCache, BlockId, InvalidationHandle};
pub use compiler::{CompileContext, Emitted, Frontend};
pub use config::JitConfig;
pub use dispatcher::{Dispatcher, RunExit};
pub use error::{CompileError, GuestException, MemoryFault};
pub use memory::{GuestContext, GuestMemory, Interpreter};
pub use regset::RegSet;
