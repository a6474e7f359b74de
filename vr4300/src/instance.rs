use std::fmt::Write;
use std::sync::mpsc;

use log::{debug, info};

use common::cli::JitOpts;
use common::{ControlMessage, EmulationCore, Instance, UpdateMessage};
use dynarec::dispatcher::DispatchStats;
use dynarec::{Dispatcher, GuestContext, JitConfig, RunExit};

use crate::frontend::Recompiler;
use crate::instructions::{CONTEXT_SLOTS, HI, LO, MIPS_REG_NAMES};
use crate::interpreter::EXC_SYSCALL;
use crate::memory::Ram;

/// A VR4300 that boots a raw big-endian image.
pub struct Vr4300Core {
    image: Vec<u8>,
    base: u32,
    entry: u32,
    ram_size: usize,
    config: JitConfig,
    budget: i64,
    disasm: bool,
}

impl Vr4300Core {
    pub fn new(image: Vec<u8>, base: u32, entry: u32) -> Vr4300Core {
        Vr4300Core {
            image,
            base,
            entry,
            ram_size: 8 << 20,
            config: JitConfig::default(),
            budget: 1_000_000,
            disasm: false,
        }
    }

    pub fn with_ram_size(mut self, size: usize) -> Vr4300Core {
        self.ram_size = size;
        self
    }

    pub fn with_jit(mut self, opts: &JitOpts) -> Vr4300Core {
        self.config = JitConfig::from(opts);
        self.budget = opts.budget;
        self.disasm = opts.disasm;
        self
    }

    pub fn instantiate(&self) -> anyhow::Result<Vr4300Instance> {
        let ram = Ram::with_image(self.base, self.ram_size, &self.image)?;
        Ok(Vr4300Instance::new(ram, self.entry, self.config, self.budget))
    }
}

impl EmulationCore for Vr4300Core {
    fn name(&self) -> &'static str {
        "NEC VR4300 (recompiled)"
    }

    fn short_name(&self) -> &'static str {
        "vr4300"
    }

    fn new_send(&self) -> anyhow::Result<Box<dyn Instance + Send>> {
        Ok(Box::new(self.instantiate()?))
    }

    fn report(&self, instance: &mut dyn Instance) -> String {
        match instance.as_any().downcast_mut::<Vr4300Instance>() {
            Some(instance) => instance.report(self.disasm),
            None => String::new(),
        }
    }
}

pub struct Vr4300Instance {
    dispatcher: Dispatcher<Recompiler>,
    context: GuestContext,
    ram: Ram,
    budget: i64,
    cycles: u64,
    stopped: Option<RunExit>,
}

impl Vr4300Instance {
    pub fn new(mut ram: Ram, entry: u32, config: JitConfig, budget: i64) -> Vr4300Instance {
        let dispatcher = Dispatcher::new(Recompiler::new(), config);
        ram.watch_code(dispatcher.invalidation_handle());
        Vr4300Instance {
            dispatcher,
            context: GuestContext::new(CONTEXT_SLOTS, entry),
            ram,
            budget: budget.max(1),
            cycles: 0,
            stopped: None,
        }
    }

    pub fn context(&self) -> &GuestContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut GuestContext {
        &mut self.context
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn dispatcher(&self) -> &Dispatcher<Recompiler> {
        &self.dispatcher
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Why the guest stopped, once it has
    pub fn stop_reason(&self) -> Option<RunExit> {
        self.stopped
    }

    /// Runs one budget's worth of cycles. A stopped guest stays stopped.
    pub fn run_slice(&mut self) -> RunExit {
        if let Some(exit) = self.stopped {
            return exit;
        }
        let exit = self.dispatcher.run(&mut self.context, &mut self.ram, self.budget);
        self.cycles += (self.budget - self.context.downcount).max(0) as u64;

        match exit {
            RunExit::Yield => {}
            RunExit::Exception(e) if e.code == EXC_SYSCALL => {
                info!("syscall at {:#010x}, halting", e.pc);
                self.stopped = Some(exit);
            }
            _ => {
                info!("guest stopped: {exit:?}");
                self.stopped = Some(exit);
            }
        }
        exit
    }

    pub fn report(&self, disasm: bool) -> String {
        let mut out = String::new();
        let stopped = match self.stopped {
            Some(exit) => format!("{exit:?}"),
            None => "running".to_owned(),
        };
        let _ = writeln!(out, "pc {:#010x} after {} cycles, {stopped}", self.context.pc, self.cycles);

        for (row, names) in MIPS_REG_NAMES.chunks(4).enumerate() {
            for (col, name) in names.iter().enumerate() {
                let _ = write!(out, "{name:>5} {:016x}  ", self.context.regs[row * 4 + col]);
            }
            out.push('\n');
        }
        let _ = writeln!(out, "{:>5} {:016x}  {:>5} {:016x}", "hi", self.context.regs[HI], "lo", self.context.regs[LO]);

        let stats = self.dispatcher.stats();
        let cache = self.dispatcher.cache().stats();
        let _ = writeln!(
            out,
            "{} blocks cached, {} compiled ({} interpreted), {} invalidated, {} links; {} blocks run, {} linked",
            self.dispatcher.cache().len(),
            stats.compiles,
            stats.fallbacks,
            cache.invalidated,
            cache.links,
            stats.blocks_run,
            stats.linked_transfers
        );

        if disasm {
            let mut starts: Vec<u32> = self.dispatcher.cache().iter().map(|block| block.start()).collect();
            starts.sort_unstable();
            for start in starts {
                if let Some(text) = self.dispatcher.disassemble_block(start) {
                    out.push('\n');
                    out.push_str(&text);
                }
            }
        }
        out
    }
}

impl Instance for Vr4300Instance {
    /// Runs whole slices, checking for a pause after each one.
    fn run(
        &mut self,
        control_rx: &mpsc::Receiver<ControlMessage>,
        update: mpsc::SyncSender<UpdateMessage>,
    ) -> anyhow::Result<()> {
        loop {
            let before = self.cycles;
            match self.run_slice() {
                RunExit::Yield => {
                    update.send(UpdateMessage::Slice { cycles: (self.cycles - before) as i64 })?;
                }
                _ => {
                    self.dispatcher.log_stats();
                    update.send(UpdateMessage::Halted)?;
                    return Ok(());
                }
            }
            if let Ok(ControlMessage::Pause) = control_rx.try_recv() {
                debug!("paused at {:#010x}", self.context.pc);
                self.dispatcher.log_stats();
                return Ok(());
            }
        }
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
