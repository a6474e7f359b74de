use super::*;
use crate::block_cache::BlockId;
use crate::regcache::HostReg;
use crate::testing::*;

const H0: HostReg = HostReg(0);
const H1: HostReg = HostReg(1);
const H2: HostReg = HostReg(2);
const H3: HostReg = HostReg(3);

fn host_config() -> HostConfig {
    HostConfig::new(4, &[2, 3])
}

fn run(code: &Bytecode, ctx: &mut GuestContext, memory: &mut VecMemory) -> (Exit, [u64; HOST_REG_COUNT]) {
    let mut rt = Runtime::new(ctx, memory, toy_interpreter, &host_config());
    let exit = code.execute(&mut rt);
    (exit, rt.host)
}

#[test]
fn alu_edge_cases() {
    assert_eq!(AluOp::Add32.eval(0x7fff_ffff, 1), 0xffff_ffff_8000_0000);
    assert_eq!(AluOp::Sub32.eval(0, 1), u64::MAX);
    assert_eq!(AluOp::Add64.eval(u64::MAX, 2), 1);
    assert_eq!(AluOp::Nor.eval(0, 0), u64::MAX);
    assert_eq!(AluOp::Slt.eval(-1i64 as u64, 0), 1);
    assert_eq!(AluOp::Sltu.eval(-1i64 as u64, 0), 0);
    assert_eq!(AluOp::Sll32.eval(1, 31), 0xffff_ffff_8000_0000);
    assert_eq!(AluOp::Sra32.eval(0x8000_0000, 4), 0xffff_ffff_f800_0000);
    assert_eq!(AluOp::Srl32.eval(0xffff_ffff_8000_0000, 4), 0x0800_0000);
    // Shift amounts wrap to the operand width
    assert_eq!(AluOp::Sll64.eval(1, 64), 1);
    assert_eq!(AluOp::Sll32.eval(1, 33), 2);

    assert_eq!(AluOp::DivS32.eval(i32::MIN as u64, -1i64 as u64), 0xffff_ffff_8000_0000);
    assert_eq!(AluOp::RemS32.eval(-7i64 as u64, 2), u64::MAX);
    assert_eq!(AluOp::DivU32.eval(7, 0), 0);
    assert_eq!(AluOp::RemU32.eval(0xffff_ffff, 0x10), 0xf);
}

#[test]
fn views_and_save_area() {
    let mut code = Bytecode::new();
    code.push(LoadSlot { dst: H0, slot: 3 });
    code.push(Extract { dst: H1, src: H0, shift: 8, width: 8, signed: false });
    code.push(Extract { dst: H2, src: H0, shift: 0, width: 8, signed: true });
    code.push(LoadImm { dst: H3, imm: 0xffff_ffff });
    code.push(Insert { dst: H3, src: H1, shift: 16, width: 8 });
    code.push(Push { src: H3 });
    code.push(LoadImm { dst: H3, imm: 0 });
    code.push(Pop { dst: H3 });
    code.push(StoreSlot { slot: 4, src: H3 });
    code.push(ExitBlock { pc: 0x40, cycles: 2, exit: 0, idle: false, link: None });

    let mut ctx = GuestContext::new(TOY_SLOTS, 0);
    ctx.regs[3] = 0x1234_56f0;
    ctx.downcount = 10;
    let (exit, host) = run(&code, &mut ctx, &mut VecMemory::new(0));

    assert_eq!(exit, Exit::Jump { pc: 0x40, exit: 0, link: None });
    assert_eq!(host[1], 0x56);
    assert_eq!(host[2], 0xffff_ffff_ffff_fff0);
    assert_eq!(ctx.regs[4], 0xff56_ffff);
    assert_eq!(ctx.pc, 0x40);
    assert_eq!(ctx.downcount, 8);
}

#[test]
fn interpreter_calls_clobber_caller_saved_registers() {
    let mut ctx = GuestContext::new(TOY_SLOTS, 0);
    let mut memory = VecMemory::new(0);
    let mut rt = Runtime::new(&mut ctx, &mut memory, toy_interpreter, &host_config());
    rt.host[..4].copy_from_slice(&[10, 11, 12, 13]);
    rt.call_interpreter(enc(NOP, 0, 0, 0), 0).unwrap();
    assert_eq!(rt.host[..4], [CLOBBER_PATTERN, CLOBBER_PATTERN, 12, 13]);
}

#[test]
fn idle_exit_drains_the_downcount() {
    let mut code = Bytecode::new();
    code.push(ExitBlock { pc: 0x10, cycles: 3, exit: 1, idle: true, link: None });

    let mut ctx = GuestContext::new(TOY_SLOTS, 0);
    ctx.downcount = 100;
    run(&code, &mut ctx, &mut VecMemory::new(0));
    assert_eq!(ctx.downcount, 0);

    // Already overdrawn stays overdrawn
    ctx.downcount = 1;
    run(&code, &mut ctx, &mut VecMemory::new(0));
    assert_eq!(ctx.downcount, -2);
}

#[test]
fn conditional_jump_targets_resolve_at_seal() {
    let mut emit = BytecodeEmitter::new();
    emit.load_imm(H0, 0);
    let skip = emit.jump_if(H0, true);
    emit.load_imm(H1, 1);
    emit.set_jump_target(skip);
    emit.exit(0x20, 1, 0, false);
    let code = emit.seal();

    assert_eq!(code.read::<JumpIf>(1).map(|j| j.target), Some(3));
    let (exit, host) = run(&code, &mut GuestContext::new(TOY_SLOTS, 0), &mut VecMemory::new(0));
    assert_eq!(exit, Exit::Jump { pc: 0x20, exit: 0, link: None });
    assert_eq!(host[1], 0);
}

#[test]
fn far_code_lands_after_the_near_code() {
    let mut emit = BytecodeEmitter::new();
    emit.load_imm(H0, 0x1000);
    emit.switch_to_far();
    let fault = emit.here();
    emit.fault_exit(8);
    emit.switch_to_near();
    emit.load_mem(H1, H0, 4, MemSize::Word, false, 8, fault);
    emit.exit(12, 3, 0, false);
    assert_eq!(emit.resolve(fault), 3);
    let code = emit.seal();

    assert_eq!(code.len(), 4);
    assert!(code.read::<FaultExit>(3).is_some());
    assert_eq!(code.read::<LoadMem>(1).map(|load| (load.fault, load.offset)), Some((3, 4)));

    let mut ctx = GuestContext::new(TOY_SLOTS, 0);
    let (exit, _) = run(&code, &mut ctx, &mut VecMemory::new(16));
    assert_eq!(exit, Exit::MemoryFault { pc: 8, address: 0x1004 });
    assert_eq!(ctx.pc, 8);
}

#[test]
fn interpreter_exception_takes_the_fault_path() {
    let mut emit = BytecodeEmitter::new();
    emit.switch_to_far();
    let fault = emit.here();
    emit.fault_exit(4);
    emit.switch_to_near();
    emit.interpret(enc(SYS, 0, 0, 0), 4, fault);
    emit.exit(8, 1, 0, false);
    let code = emit.seal();

    let mut ctx = GuestContext::new(TOY_SLOTS, 0);
    ctx.downcount = 5;
    let (exit, _) = run(&code, &mut ctx, &mut VecMemory::new(0));
    assert_eq!(exit, Exit::Exception(GuestException { code: TOY_SYSCALL, pc: 4 }));
    assert_eq!(ctx.downcount, 5);
}

#[test]
fn exit_sites_can_be_patched_in_place() {
    let mut code = Bytecode::new();
    let site = code.push(ExitBlock { pc: 0x80, cycles: 7, exit: 2, idle: false, link: None });
    assert!(code.read::<LoadImm>(site).is_none());

    let mut exit = code.read::<ExitBlock>(site).unwrap();
    exit.link = BlockId::from_bits(5 | 1 << 32);
    code.patch(site, exit);

    let patched = code.read::<ExitBlock>(site).unwrap();
    assert_eq!(patched.cycles, 7);
    assert_eq!(patched.link, BlockId::from_bits(5 | 1 << 32));
    assert_eq!(patched.to_string(), "exit    0x00000080 ; #2 cycles 7 -> block 5.1");
}

#[test]
#[should_panic(expected = "wrong operation")]
fn patching_with_another_operation_panics() {
    let mut code = Bytecode::new();
    code.push(LoadImm { dst: H0, imm: 1 });
    code.patch(0, Jump { target: 0 });
}

#[test]
fn disassembly_prints_every_record() {
    let mut emit = BytecodeEmitter::new();
    emit.switch_to_far();
    let fault = emit.here();
    emit.fault_exit(0x10);
    emit.switch_to_near();
    crate::regcache::Emitter::load_slot(&mut emit, H0, 3);
    emit.alu(AluOp::Sub32, H1, H0, H0);
    emit.alu_imm(AluOp::Sltu, H2, H0, 9);
    let skip = emit.jump_if(H2, true);
    emit.store_mem(H1, H0, -8, MemSize::Half, 0x10, fault);
    emit.set_jump_target(skip);
    emit.exit_indirect(H1, 4, 1);
    let code = emit.seal();

    let mut text = String::new();
    let count = code.disassemble(&mut text).unwrap();
    assert_eq!(count, code.len());
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        [
            "   0: ldctx   h0, ctx[3]",
            "   1: sub32   h1, h0, h0",
            "   2: sltu    h2, h0, #0x9",
            "   3: jz      h2, @5",
            "   4: sth     -8(h0), h1 ; pc 0x00000010, fault @6",
            "   5: exit    h1 ; #1 cycles 4",
            "   6: fault   0x00000010",
        ]
    );
}

fn stray(_rt: &mut Runtime<'_>, _operands: &Operands) -> Flow {
    Flow::Continue
}

#[test]
fn disassembly_stops_at_an_unknown_callback() {
    let mut code = Bytecode::new();
    code.push(LoadImm { dst: H0, imm: 5 });
    code.push_record(Record::new(stray, Operands::default()));
    code.push(LoadImm { dst: H1, imm: 6 });

    let mut text = String::new();
    assert_eq!(code.disassemble(&mut text).unwrap(), 1);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "   0: li      h0, 0x5");
    assert!(lines[1].starts_with("   1: UNKNOWN OR ILLEGAL CALLBACK 0x"));
}

#[test]
#[should_panic(expected = "empty save area")]
fn pop_from_an_empty_save_area_panics() {
    let mut code = Bytecode::new();
    code.push(Pop { dst: H0 });
    run(&code, &mut GuestContext::new(TOY_SLOTS, 0), &mut VecMemory::new(0));
}

#[test]
#[should_panic(expected = "ran past the end")]
fn units_must_end_in_an_exit() {
    let mut code = Bytecode::new();
    code.push(LoadImm { dst: H0, imm: 5 });
    run(&code, &mut GuestContext::new(TOY_SLOTS, 0), &mut VecMemory::new(0));
}
