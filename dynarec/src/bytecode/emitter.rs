use super::{
    Alu, AluImm, AluOp, Bytecode, ExitBlock, ExitIndirect, Extract, FaultExit, Insert, Interpret, Jump, JumpIf,
    LoadImm, LoadMem, LoadSlot, MemSize, Move, Operation, Pop, Push, StoreMem, StoreSlot,
};
use crate::regcache::{Emitter, HostReg};

/// A record position in either the near or the far buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label {
    far: bool,
    index: u32,
}

/// A jump whose target is not known yet.
#[must_use = "a branch needs a target"]
#[derive(Debug)]
pub struct FixupBranch {
    record: Label,
    word: usize,
}

/// Builds one compiled unit.
///
/// Rarely taken paths (fault handling) go to a separate far buffer that is appended after
/// the near code when the unit is sealed, so the straight-line path stays contiguous.
#[derive(Debug, Default)]
pub struct BytecodeEmitter {
    near: Bytecode,
    far: Bytecode,
    in_far: bool,
    /// Operand words holding record indices, patched at seal
    targets: Vec<(Label, usize, Label)>,
}

impl BytecodeEmitter {
    pub fn new() -> Self {
        BytecodeEmitter::default()
    }

    fn current(&mut self) -> &mut Bytecode {
        if self.in_far {
            &mut self.far
        } else {
            &mut self.near
        }
    }

    /// Where the next record will go
    pub fn here(&self) -> Label {
        let len = if self.in_far { self.far.len() } else { self.near.len() };
        Label { far: self.in_far, index: len as u32 }
    }

    pub fn emit<O: Operation>(&mut self, op: O) -> Label {
        let label = self.here();
        self.current().push(op);
        label
    }

    fn emit_targeting<O: Operation>(&mut self, op: O, word: usize, target: Label) -> Label {
        let label = self.emit(op);
        self.targets.push((label, word, target));
        label
    }

    pub fn switch_to_far(&mut self) {
        assert!(!self.in_far, "already emitting far code");
        self.in_far = true;
    }

    pub fn switch_to_near(&mut self) {
        assert!(self.in_far, "not emitting far code");
        self.in_far = false;
    }

    pub fn in_far_code(&self) -> bool {
        self.in_far
    }

    /// Records emitted so far, both buffers
    pub fn len(&self) -> usize {
        self.near.len() + self.far.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn jump(&mut self) -> FixupBranch {
        let record = self.emit(Jump { target: 0 });
        FixupBranch { record, word: 0 }
    }

    pub fn jump_if(&mut self, cond: HostReg, when_zero: bool) -> FixupBranch {
        let record = self.emit(JumpIf { cond, when_zero, target: 0 });
        FixupBranch { record, word: 1 }
    }

    /// Points `fixup` at the next record emitted.
    pub fn set_jump_target(&mut self, fixup: FixupBranch) {
        let here = self.here();
        self.targets.push((fixup.record, fixup.word, here));
    }

    pub fn load_imm(&mut self, dst: HostReg, imm: u64) {
        self.emit(LoadImm { dst, imm });
    }

    pub fn alu(&mut self, op: AluOp, dst: HostReg, a: HostReg, b: HostReg) {
        self.emit(Alu { op, dst, a, b });
    }

    pub fn alu_imm(&mut self, op: AluOp, dst: HostReg, a: HostReg, imm: u64) {
        self.emit(AluImm { op, dst, a, imm });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn load_mem(
        &mut self,
        dst: HostReg,
        base: HostReg,
        offset: i32,
        size: MemSize,
        signed: bool,
        pc: u32,
        fault: Label,
    ) {
        self.emit_targeting(LoadMem { dst, base, size, signed, offset, pc, fault: 0 }, 2, fault);
    }

    pub fn store_mem(&mut self, src: HostReg, base: HostReg, offset: i32, size: MemSize, pc: u32, fault: Label) {
        self.emit_targeting(StoreMem { src, base, size, offset, pc, fault: 0 }, 2, fault);
    }

    pub fn interpret(&mut self, word: u32, pc: u32, fault: Label) {
        self.emit_targeting(Interpret { word, pc, fault: 0 }, 1, fault);
    }

    pub fn exit(&mut self, pc: u32, cycles: u32, exit: u16, idle: bool) -> Label {
        self.emit(ExitBlock { pc, cycles, exit, idle, link: None })
    }

    pub fn exit_indirect(&mut self, src: HostReg, cycles: u32, exit: u16) -> Label {
        self.emit(ExitIndirect { src, cycles, exit })
    }

    pub fn fault_exit(&mut self, pc: u32) -> Label {
        self.emit(FaultExit { pc })
    }

    /// The final record index of `label`. Only meaningful once no more near code is emitted.
    pub fn resolve(&self, label: Label) -> usize {
        if label.far {
            self.near.len() + label.index as usize
        } else {
            label.index as usize
        }
    }

    /// Appends the far code and patches every branch target.
    pub fn seal(mut self) -> Bytecode {
        assert!(!self.in_far, "sealed while emitting far code");
        let targets = std::mem::take(&mut self.targets);
        let resolved: Vec<(usize, usize, usize)> = targets
            .iter()
            .map(|&(record, word, target)| (self.resolve(record), word, self.resolve(target)))
            .collect();

        let mut code = self.near;
        code.records.append(&mut self.far.records);
        for (record, word, target) in resolved {
            code.records[record].operands.0[word] = target as u64;
        }
        code
    }
}

impl Emitter for BytecodeEmitter {
    fn load_slot(&mut self, dst: HostReg, slot: u16) {
        self.emit(LoadSlot { dst, slot });
    }

    fn store_slot(&mut self, slot: u16, src: HostReg) {
        self.emit(StoreSlot { slot, src });
    }

    fn mov(&mut self, dst: HostReg, src: HostReg) {
        self.emit(Move { dst, src });
    }

    fn extract(&mut self, dst: HostReg, src: HostReg, shift: u8, width: u8, signed: bool) {
        self.emit(Extract { dst, src, shift, width, signed });
    }

    fn insert(&mut self, dst: HostReg, src: HostReg, shift: u8, width: u8) {
        self.emit(Insert { dst, src, shift, width });
    }

    fn push(&mut self, src: HostReg) {
        self.emit(Push { src });
    }

    fn pop(&mut self, dst: HostReg) {
        self.emit(Pop { dst });
    }
}
