use thiserror::Error;

/// A guest memory access that could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest memory fault at {address:#010x}")]
pub struct MemoryFault {
    pub address: u32,
}

/// An architectural exception raised while running guest code.
///
/// `code` is the guest's own exception number; the core never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest exception {code} at {pc:#010x}")]
pub struct GuestException {
    pub code: u32,
    pub pc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("block at {0:#010x} has no instructions")]
    EmptyBlock(u32),
    #[error("cannot compile `{name}` at {address:#010x}")]
    Unsupported { address: u32, name: &'static str },
}
