//! The N64's VR4300 CPU on the recompiler core: decoding, an interpreter for what is not
//! compiled, the code generator, and a bootable instance over flat RAM.

pub mod asm;
pub mod frontend;
pub mod instance;
pub mod instructions;
pub mod interpreter;
pub mod memory;

pub use frontend::Recompiler;
pub use instance::{Vr4300Core, Vr4300Instance};
pub use instructions::{decode, Instruction, Op, Vr4300};
pub use memory::Ram;
