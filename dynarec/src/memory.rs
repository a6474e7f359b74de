//! Guest-side state the recompiled code reads and writes: memory and the register context.

use crate::error::MemoryFault;

/// Byte-addressed guest memory as seen by the core.
///
/// Implementations decide endianness and which accesses fault.
pub trait GuestMemory {
    fn read_u8(&mut self, address: u32) -> Result<u8, MemoryFault>;
    fn read_u16(&mut self, address: u32) -> Result<u16, MemoryFault>;
    fn read_u32(&mut self, address: u32) -> Result<u32, MemoryFault>;
    fn write_u8(&mut self, address: u32, value: u8) -> Result<(), MemoryFault>;
    fn write_u16(&mut self, address: u32, value: u16) -> Result<(), MemoryFault>;
    fn write_u32(&mut self, address: u32, value: u32) -> Result<(), MemoryFault>;

    /// Fetches an instruction word. Separate from data reads so an implementation can
    /// apply instruction-side translation or permissions.
    fn read_code(&mut self, address: u32) -> Result<u32, MemoryFault> {
        self.read_u32(address)
    }
}

/// The guest register table plus the bookkeeping every block touches.
///
/// `regs` is indexed by the primary slot numbers of the architecture's register layout;
/// anything the layout does not cache (FPRs, control registers) may follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestContext {
    pub regs: Vec<u64>,
    pub pc: u32,
    /// Cycles left before control returns to the scheduler
    pub downcount: i64,
}

impl GuestContext {
    pub fn new(slots: usize, pc: u32) -> Self {
        GuestContext {
            regs: vec![0; slots],
            pc,
            downcount: 0,
        }
    }
}

/// A runtime fallback that executes one guest instruction word against the context.
pub type Interpreter = fn(
    &mut GuestContext,
    &mut dyn GuestMemory,
    word: u32,
    pc: u32,
) -> Result<(), crate::error::GuestException>;
