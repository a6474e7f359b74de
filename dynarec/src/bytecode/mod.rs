//! The execution tier: a compiled block is a flat list of records, each a pointer to a
//! non-generic callback plus a fixed block of operand words. Executing a block walks the list
//! and calls each callback, which is how a cached interpreter avoids decoding guest
//! instructions more than once.
//!
//! Callbacks operate on a small host register model ([`Runtime`]) with the same calling
//! convention constraints a machine-code backend would have, so the register cache's
//! decisions are observable and testable here.

use std::fmt;
use std::sync::OnceLock;

use crate::block_cache::BlockId;
use crate::error::GuestException;
use crate::memory::{GuestContext, GuestMemory, Interpreter};
use crate::regcache::{HostConfig, MAX_HOST_REGS};

mod emitter;
mod ops;

pub use emitter::{BytecodeEmitter, FixupBranch, Label};
pub use ops::*;

pub const OPERAND_WORDS: usize = 3;
pub const HOST_REG_COUNT: usize = MAX_HOST_REGS;
/// What caller-saved host registers hold after a runtime call
pub const CLOBBER_PATTERN: u64 = 0xdead_beef_dead_beef;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Operands(pub [u64; OPERAND_WORDS]);

pub type Callback = fn(&mut Runtime<'_>, &Operands) -> Flow;

/// What a record tells the executor to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Continue at this record index of the same unit
    Jump(usize),
    Exit(Exit),
}

/// How control left a compiled unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Through exit site `exit`, continuing at `pc`. `link` is the unit this site was patched to
    /// enter directly.
    Jump { pc: u32, exit: u16, link: Option<BlockId> },
    Exception(GuestException),
    MemoryFault { pc: u32, address: u32 },
}

/// A fault noticed by one record and reported by the fault path it jumps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingFault {
    Memory(u32),
    Exception(GuestException),
}

#[derive(Clone, Copy)]
pub struct Record {
    callback: Callback,
    operands: Operands,
}

impl Record {
    pub fn new(callback: Callback, operands: Operands) -> Self {
        Record { callback, operands }
    }

    pub fn callback_address(&self) -> usize {
        self.callback as usize
    }

    pub fn operands(&self) -> &Operands {
        &self.operands
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = String::new();
        match lookup(self.callback_address()) {
            Some(format) => format(&self.operands, &mut text)?,
            None => text.push_str("<unknown>"),
        }
        f.write_str(&text)
    }
}

/// A record type: how its fields are stored in [`Operands`] and which callback runs it.
pub trait Operation: Copy + fmt::Display {
    const CALLBACK: Callback;

    fn pack(self) -> Operands;
    fn unpack(operands: &Operands) -> Self;

    fn record(self) -> Record {
        Record::new(Self::CALLBACK, self.pack())
    }
}

/// The host state compiled code runs against.
pub struct Runtime<'a> {
    pub host: [u64; HOST_REG_COUNT],
    pub save_area: Vec<u64>,
    pub context: &'a mut GuestContext,
    pub memory: &'a mut dyn GuestMemory,
    pub fault: Option<PendingFault>,
    interpreter: Interpreter,
    clobber_mask: u8,
}

impl<'a> Runtime<'a> {
    pub fn new(
        context: &'a mut GuestContext,
        memory: &'a mut dyn GuestMemory,
        interpreter: Interpreter,
        config: &HostConfig,
    ) -> Self {
        Runtime {
            host: [0; HOST_REG_COUNT],
            save_area: Vec::new(),
            context,
            memory,
            fault: None,
            interpreter,
            clobber_mask: config.caller_saved_mask(),
        }
    }

    /// Runs the interpreter fallback. Like any runtime call it clobbers the caller-saved registers.
    pub fn call_interpreter(&mut self, word: u32, pc: u32) -> Result<(), GuestException> {
        let result = (self.interpreter)(&mut *self.context, &mut *self.memory, word, pc);
        for (i, reg) in self.host.iter_mut().enumerate() {
            if self.clobber_mask & (1 << i) != 0 {
                *reg = CLOBBER_PATTERN;
            }
        }
        result
    }
}

/// A sealed sequence of records.
#[derive(Clone, Default)]
pub struct Bytecode {
    records: Vec<Record>,
}

impl Bytecode {
    pub fn new() -> Self {
        Bytecode::default()
    }

    pub fn push<O: Operation>(&mut self, op: O) -> usize {
        self.push_record(op.record())
    }

    pub fn push_record(&mut self, record: Record) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    /// The record at `index`, if it is an `O`
    pub fn read<O: Operation>(&self, index: usize) -> Option<O> {
        let record = self.records.get(index)?;
        (record.callback_address() == O::CALLBACK as usize).then(|| O::unpack(&record.operands))
    }

    /// Replaces the operands of the `O` at `index`.
    pub fn patch<O: Operation>(&mut self, index: usize, op: O) {
        let record = &mut self.records[index];
        assert_eq!(record.callback_address(), O::CALLBACK as usize, "patching record {index} with the wrong operation");
        record.operands = op.pack();
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn execute(&self, rt: &mut Runtime<'_>) -> Exit {
        execute(self, rt)
    }

    pub fn disassemble(&self, out: &mut impl fmt::Write) -> Result<usize, fmt::Error> {
        disassemble(self, out)
    }
}

impl fmt::Debug for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.records).finish()
    }
}

/// Runs records from the first until one exits the unit.
pub fn execute(code: &Bytecode, rt: &mut Runtime<'_>) -> Exit {
    let records = code.records();
    let mut index = 0;
    loop {
        let Some(record) = records.get(index) else {
            panic!("execution ran past the end of a unit with {} records", records.len());
        };
        match (record.callback)(rt, &record.operands) {
            Flow::Continue => index += 1,
            Flow::Jump(target) => index = target,
            Flow::Exit(exit) => return exit,
        }
    }
}

type Formatter = fn(&Operands, &mut dyn fmt::Write) -> fmt::Result;

fn format_operation<O: Operation>(operands: &Operands, out: &mut dyn fmt::Write) -> fmt::Result {
    write!(out, "{}", O::unpack(operands))
}

fn entry<O: Operation>() -> (usize, Formatter) {
    (O::CALLBACK as usize, format_operation::<O>)
}

static FORMATTERS: OnceLock<Vec<(usize, Formatter)>> = OnceLock::new();

fn lookup(callback: usize) -> Option<Formatter> {
    let table = FORMATTERS.get_or_init(|| {
        let mut table = vec![
            entry::<LoadSlot>(),
            entry::<StoreSlot>(),
            entry::<Move>(),
            entry::<LoadImm>(),
            entry::<Alu>(),
            entry::<AluImm>(),
            entry::<Extract>(),
            entry::<Insert>(),
            entry::<Push>(),
            entry::<Pop>(),
            entry::<LoadMem>(),
            entry::<StoreMem>(),
            entry::<Jump>(),
            entry::<JumpIf>(),
            entry::<Interpret>(),
            entry::<ExitBlock>(),
            entry::<ExitIndirect>(),
            entry::<FaultExit>(),
        ];
        table.sort_by_key(|&(address, _)| address);
        table
    });
    table
        .binary_search_by_key(&callback, |&(address, _)| address)
        .ok()
        .map(|i| table[i].1)
}

/// Writes one line per record. Stops at the first record whose callback is not a known
/// operation. Returns how many records were printed.
pub fn disassemble(code: &Bytecode, out: &mut impl fmt::Write) -> Result<usize, fmt::Error> {
    let mut count = 0;
    for (index, record) in code.records().iter().enumerate() {
        match lookup(record.callback_address()) {
            Some(format) => {
                write!(out, "{index:4}: ")?;
                format(&record.operands, out)?;
                writeln!(out)?;
                count += 1;
            }
            None => {
                writeln!(out, "{index:4}: UNKNOWN OR ILLEGAL CALLBACK {:#x}", record.callback_address())?;
                break;
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests;
