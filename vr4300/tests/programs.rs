use dynarec::{AnalyzerOptions, GuestException, JitConfig, RunExit};
use vr4300::asm::*;
use vr4300::instructions::{HI, LO};
use vr4300::interpreter::{EXC_OVERFLOW, EXC_SYSCALL};
use vr4300::{Ram, Vr4300Instance};

const BASE: u32 = 0x8000_0000;

const ZERO: u8 = 0;
const V0: u8 = 2;
const V1: u8 = 3;
const A0: u8 = 4;
const A1: u8 = 5;
const T0: u8 = 8;
const T1: u8 = 9;
const S0: u8 = 16;
const S1: u8 = 17;
const SP: u8 = 29;
const RA: u8 = 31;

fn sext(address: u32) -> u64 {
    address as i32 as i64 as u64
}

fn boot(program: &[(u32, &[u32])], config: JitConfig) -> Vr4300Instance {
    let mut ram = Ram::new(BASE, 0x1_0000);
    for &(offset, words) in program {
        ram.load_words(BASE + offset, words).unwrap();
    }
    Vr4300Instance::new(ram, BASE, config, 100_000)
}

fn configs() -> [JitConfig; 4] {
    [
        JitConfig::default(),
        JitConfig { block_link: false, ..Default::default() },
        JitConfig { analyzer: AnalyzerOptions::empty(), max_block_size: 3, ..Default::default() },
        JitConfig::single_step(),
    ]
}

fn syscall_at(offset: u32) -> RunExit {
    RunExit::Exception(GuestException { code: EXC_SYSCALL, pc: BASE + offset })
}

fn sum_loop() -> Vec<u32> {
    vec![
        ori(T0, ZERO, 10),
        or(V0, ZERO, ZERO),
        addu(V0, V0, T0),
        addiu(T0, T0, -1),
        bne(T0, ZERO, -3),
        nop(),
        syscall(),
    ]
}

fn call_and_return() -> (Vec<u32>, Vec<u32>) {
    let main = vec![
        lui(SP, 0x8000),
        ori(SP, SP, 0x8000),
        ori(A0, ZERO, 7),
        jal(BASE + 0x40),
        addiu(SP, SP, -8),
        addu(S0, V0, ZERO),
        syscall(),
    ];
    let function = vec![sw(RA, 4, SP), sll(V0, A0, 2), lw(T1, 4, SP), jr(RA), addiu(V0, V0, 1)];
    (main, function)
}

fn divisions() -> Vec<u32> {
    vec![
        ori(A0, ZERO, 100),
        ori(A1, ZERO, 7),
        div(A0, A1),
        mflo(V0),
        mfhi(V1),
        div(A0, ZERO),
        mflo(T0),
        mfhi(T1),
        syscall(),
    ]
}

#[test]
fn loop_sums_down_to_zero() {
    let mut cpu = boot(&[(0, &sum_loop()[..])], JitConfig::default());
    assert_eq!(cpu.run_slice(), syscall_at(0x18));
    assert_eq!(cpu.context().regs[V0 as usize], 55);
    assert_eq!(cpu.context().regs[T0 as usize], 0);
    assert!(cpu.stats().blocks_run >= 2);
}

#[test]
fn call_saves_and_restores_the_link() {
    let (main, function) = call_and_return();
    let mut cpu = boot(&[(0, &main[..]), (0x40, &function[..])], JitConfig::default());
    assert_eq!(cpu.run_slice(), syscall_at(0x18));

    let regs = &cpu.context().regs;
    assert_eq!(regs[S0 as usize], 29);
    assert_eq!(regs[RA as usize], sext(BASE + 0x14));
    assert_eq!(regs[T1 as usize], sext(BASE + 0x14));
    assert_eq!(regs[SP as usize], sext(0x8000_7ff8));
    assert_eq!(cpu.ram().read_word(0x8000_7ffc), Ok(BASE + 0x14));
}

#[test]
fn division_rejoins_after_either_arm() {
    let mut cpu = boot(&[(0, &divisions()[..])], JitConfig::default());
    assert_eq!(cpu.run_slice(), syscall_at(0x20));

    let regs = &cpu.context().regs;
    assert_eq!((regs[V0 as usize], regs[V1 as usize]), (14, 2));
    assert_eq!((regs[T0 as usize], regs[T1 as usize]), (u64::MAX, 100));
    assert_eq!((regs[LO], regs[HI]), (u64::MAX, 100));
}

#[test]
fn likely_branch_skips_its_slot_when_falling_through() {
    let program = [
        ori(T0, ZERO, 3),
        or(V0, ZERO, ZERO),
        addiu(T0, T0, -1),
        bnel(T0, ZERO, -2),
        addiu(V0, V0, 10),
        syscall(),
    ];
    for config in configs() {
        let mut cpu = boot(&[(0, &program[..])], config);
        assert_eq!(cpu.run_slice(), syscall_at(0x14), "{config:?}");
        assert_eq!(cpu.context().regs[V0 as usize], 20, "{config:?}");
    }
}

#[test]
fn every_configuration_agrees() {
    let (main, function) = call_and_return();
    let programs: [Vec<(u32, Vec<u32>)>; 3] =
        [vec![(0, sum_loop())], vec![(0, main), (0x40, function)], vec![(0, divisions())]];

    for program in &programs {
        let layout: Vec<(u32, &[u32])> = program.iter().map(|(offset, words)| (*offset, words.as_slice())).collect();
        let results: Vec<_> = configs()
            .into_iter()
            .map(|config| {
                let mut cpu = boot(&layout, config);
                let exit = cpu.run_slice();
                (exit, cpu.context().regs.clone(), cpu.context().pc)
            })
            .collect();
        for other in &results[1..] {
            assert_eq!(other, &results[0]);
        }
    }
}

#[test]
fn compiled_load_from_unmapped_memory_faults() {
    let program = [ori(T0, ZERO, 5), lui(A0, 0x9000), lw(V0, 8, A0), syscall()];
    let mut cpu = boot(&[(0, &program[..])], JitConfig::default());
    assert_eq!(cpu.run_slice(), RunExit::MemoryFault { pc: BASE + 8, address: 0x9000_0008 });
    assert_eq!(cpu.context().pc, BASE + 8);
    assert_eq!(cpu.context().regs[T0 as usize], 5);
    assert_eq!(cpu.context().regs[V0 as usize], 0);

    // Stopped for good
    assert_eq!(cpu.run_slice(), RunExit::MemoryFault { pc: BASE + 8, address: 0x9000_0008 });
}

#[test]
fn overflowing_add_raises_through_the_interpreter() {
    let program = [lui(A0, 0x7fff), ori(A0, A0, 0xffff), addi(V0, A0, 1), syscall()];
    let mut cpu = boot(&[(0, &program[..])], JitConfig::default());
    assert_eq!(cpu.run_slice(), RunExit::Exception(GuestException { code: EXC_OVERFLOW, pc: BASE + 8 }));
    assert_eq!(cpu.context().regs[V0 as usize], 0);
}

#[test]
fn patched_code_is_recompiled() {
    let main = [
        lui(T0, 0x8000),
        lw(T1, 0x100, T0),
        jal(BASE + 0x80),
        nop(),
        addu(S0, V0, ZERO),
        sw(T1, 0x80, T0),
        jal(BASE + 0x80),
        nop(),
        addu(S1, V0, ZERO),
        syscall(),
    ];
    let function = [ori(V0, ZERO, 1), jr(RA), nop()];
    let patch = [ori(V0, ZERO, 2)];

    // Calls are not inlined, each one enters the block at 0x80
    let config = JitConfig { analyzer: AnalyzerOptions::empty(), ..Default::default() };
    let mut cpu = boot(&[(0, &main[..]), (0x80, &function[..]), (0x100, &patch[..])], config);
    assert_eq!(cpu.run_slice(), syscall_at(0x24));
    assert_eq!(cpu.context().regs[S0 as usize], 1);
    assert_eq!(cpu.context().regs[S1 as usize], 2);
    assert!(cpu.dispatcher().cache().stats().invalidated >= 1);
}

#[test]
fn budget_yields_and_resumes() {
    let spin = [addiu(V0, V0, 1), j(BASE), nop()];
    let mut cpu = boot(&[(0, &spin[..])], JitConfig::default());
    assert_eq!(cpu.run_slice(), RunExit::Yield);
    let first = cpu.context().regs[V0 as usize];
    assert!(first > 0);
    assert_eq!(cpu.run_slice(), RunExit::Yield);
    assert!(cpu.context().regs[V0 as usize] > first);
    assert!(cpu.cycles() >= 200_000);
}
