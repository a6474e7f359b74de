//! The outer loop: find or compile the block at the guest pc, run it, follow its exit.

use std::fmt::Write;
use std::ops::Range;

use log::{debug, warn};

use crate::analyzer::Analyzer;
use crate::block_cache::{BlockCache, BlockId, InvalidationHandle, InvalidationQueue};
use crate::bytecode::{Exit, Runtime};
use crate::compiler::{compile, compile_interpreted, Frontend};
use crate::config::JitConfig;
use crate::error::GuestException;
use crate::memory::{GuestContext, GuestMemory};

/// Why [`Dispatcher::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The cycle budget is spent
    Yield,
    /// Nothing could be fetched or compiled at `pc`
    InstructionFault { pc: u32 },
    Exception(GuestException),
    MemoryFault { pc: u32, address: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub compiles: u64,
    /// Blocks that had to be interpreted instead
    pub fallbacks: u64,
    pub cache_hits: u64,
    pub linked_transfers: u64,
    pub blocks_run: u64,
}

pub struct Dispatcher<F: Frontend> {
    frontend: F,
    analyzer: Analyzer,
    cache: BlockCache,
    config: JitConfig,
    invalidations: InvalidationQueue,
    stats: DispatchStats,
}

impl<F: Frontend> Dispatcher<F> {
    pub fn new(frontend: F, config: JitConfig) -> Self {
        Dispatcher {
            frontend,
            analyzer: Analyzer::new(config.analyzer_options()),
            cache: BlockCache::new(),
            config,
            invalidations: InvalidationQueue::new(),
            stats: DispatchStats::default(),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Compiled code depends on the config, so the cache starts over.
    pub fn set_config(&mut self, config: JitConfig) {
        self.config = config;
        self.analyzer.set_options(config.analyzer_options());
        self.cache.clear();
    }

    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// For code outside the execution thread that writes guest memory.
    pub fn invalidation_handle(&self) -> InvalidationHandle {
        self.invalidations.handle()
    }

    pub fn invalidate(&mut self, range: Range<u32>) -> usize {
        self.cache.invalidate(range)
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    fn apply_invalidations(&mut self) {
        for range in self.invalidations.drain() {
            self.cache.invalidate(range);
        }
    }

    /// Runs guest code from `context.pc` until `budget` cycles are spent or something stops it.
    pub fn run(&mut self, context: &mut GuestContext, memory: &mut dyn GuestMemory, budget: i64) -> RunExit {
        context.downcount = budget;
        let mut rt = Runtime::new(context, memory, self.frontend.interpreter(), self.frontend.host_config());
        let mut linked: Option<BlockId> = None;

        loop {
            self.apply_invalidations();
            if rt.context.downcount <= 0 {
                return RunExit::Yield;
            }

            let pc = rt.context.pc;
            let live_link = linked
                .take()
                .filter(|&id| self.cache.get(id).is_some_and(|block| block.start() == pc));
            let id = match live_link {
                Some(id) => {
                    self.stats.linked_transfers += 1;
                    id
                }
                None => match self.cache.lookup(pc) {
                    Some(id) => {
                        self.stats.cache_hits += 1;
                        id
                    }
                    None => match self.compile_at(&mut *rt.memory, pc) {
                        Ok(id) => id,
                        Err(exit) => return exit,
                    },
                },
            };

            let Some(block) = self.cache.get_mut(id) else {
                panic!("{id} vanished between lookup and execution");
            };
            block.run_count += 1;
            self.stats.blocks_run += 1;
            match block.unit.code.execute(&mut rt) {
                Exit::Jump { link, .. } => linked = link,
                Exit::Exception(exception) => return RunExit::Exception(exception),
                Exit::MemoryFault { pc, address } => return RunExit::MemoryFault { pc, address },
            }
        }
    }

    /// Analyzes, compiles and caches the block at `pc`, interpreting its first instruction
    /// when the frontend cannot compile it.
    pub fn compile_at(&mut self, memory: &mut dyn GuestMemory, pc: u32) -> Result<BlockId, RunExit> {
        let block = self.analyzer.analyze(self.frontend.arch(), memory, pc, self.config.block_size());
        if block.is_empty() {
            debug!("nothing to compile at {pc:#010x}");
            return Err(RunExit::InstructionFault { pc });
        }

        let unit = match compile(&mut self.frontend, &block) {
            Ok(unit) => unit,
            Err(error) => {
                warn!("{error}; interpreting {pc:#010x}");
                self.stats.fallbacks += 1;
                compile_interpreted(&self.frontend, &block).map_err(|error| {
                    warn!("{error}");
                    RunExit::InstructionFault { pc }
                })?
            }
        };

        debug!(
            "compiled {pc:#010x}: {} instructions into {} records, {} exits",
            unit.instruction_count,
            unit.code.len(),
            unit.exits.len()
        );
        self.stats.compiles += 1;
        let id = self.cache.insert(unit);
        if self.config.links_blocks() {
            self.cache.link(id);
        }
        Ok(id)
    }

    /// The bytecode of the block entered at `address`, if it is cached.
    pub fn disassemble_block(&self, address: u32) -> Option<String> {
        let block = self.cache.get(self.cache.lookup(address)?)?;
        let mut out = String::new();
        writeln!(
            out,
            "{} at {address:#010x}: {} instructions, {} cycles, run {} times",
            block.id, block.unit.instruction_count, block.unit.cycles, block.run_count
        )
        .ok()?;
        block.unit.code.disassemble(&mut out).ok()?;
        Some(out)
    }

    pub fn log_stats(&self) {
        let cache = self.cache.stats();
        debug!(
            "{} compiles ({} interpreted), {} hits, {} linked transfers, {} blocks run; \
             cache: {} links, {} unlinks, {} invalidated",
            self.stats.compiles,
            self.stats.fallbacks,
            self.stats.cache_hits,
            self.stats.linked_transfers,
            self.stats.blocks_run,
            cache.links,
            cache.unlinks,
            cache.invalidated
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalyzerOptions;
    use crate::testing::*;

    fn plain() -> JitConfig {
        JitConfig { analyzer: AnalyzerOptions::empty(), ..Default::default() }
    }

    fn memory(words: &[u32]) -> VecMemory {
        let mut memory = VecMemory::from_words(words);
        memory.bytes.resize(0x100, 0);
        memory
    }

    #[test]
    fn loop_runs_through_links_until_the_budget_is_spent() {
        let mut memory = memory(&[enc(LI, 1, 0, 0), enc(ADD, 1, 1, 2), enc(B, 0, 0, 1)]);
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        ctx.regs[2] = 1;
        let mut jit = Dispatcher::new(ToyFrontend::new(), plain());

        assert_eq!(jit.run(&mut ctx, &mut memory, 11), RunExit::Yield);
        assert_eq!(ctx.regs[1], 5);
        assert_eq!(ctx.pc, 4);
        let stats = jit.stats();
        assert_eq!(stats.compiles, 2);
        assert_eq!(stats.linked_transfers, 3);
        jit.cache().verify();

        // Everything is cached now
        assert_eq!(jit.run(&mut ctx, &mut memory, 2), RunExit::Yield);
        assert_eq!(jit.stats().compiles, 2);
        assert_eq!(jit.stats().cache_hits, 1);
    }

    #[test]
    fn cross_thread_invalidation_applies_before_the_next_block() {
        let mut memory = memory(&[enc(LI, 1, 0, 0), enc(ADD, 1, 1, 2), enc(B, 0, 0, 1)]);
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        let mut jit = Dispatcher::new(ToyFrontend::new(), plain());
        jit.run(&mut ctx, &mut memory, 8);
        assert_eq!(jit.cache().len(), 2);

        memory.write_u32(4, enc(LI, 3, 0, 0x77)).unwrap();
        let handle = jit.invalidation_handle();
        std::thread::spawn(move || assert!(handle.invalidate(4..8))).join().unwrap();

        ctx.pc = 4;
        jit.run(&mut ctx, &mut memory, 4);
        assert_eq!(ctx.regs[3], 0x77);
        // The block at 0 covers 4..8 as well
        assert_eq!(jit.cache().stats().invalidated, 2);
        jit.cache().verify();
    }

    #[test]
    fn unmapped_entry_is_an_instruction_fault() {
        let mut memory = memory(&[]);
        let mut ctx = GuestContext::new(TOY_SLOTS, 0x1000);
        let mut jit = Dispatcher::new(ToyFrontend::new(), JitConfig::default());
        assert_eq!(jit.run(&mut ctx, &mut memory, 10), RunExit::InstructionFault { pc: 0x1000 });
    }

    #[test]
    fn single_step_compiles_one_instruction_per_block() {
        let mut memory = memory(&[enc(LI, 1, 0, 1), enc(LI, 2, 0, 2), enc(ADD, 3, 1, 2), enc(B, 0, 0, 0)]);
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        let mut jit = Dispatcher::new(ToyFrontend::new(), JitConfig::single_step());
        jit.run(&mut ctx, &mut memory, 6);
        assert_eq!(ctx.regs[3], 3);
        assert!(jit.cache().iter().all(|block| block.unit.instruction_count == 1));
        assert_eq!(jit.stats().linked_transfers, 0);
        assert!(jit.disassemble_block(8).is_some_and(|text| text.contains("add")));
    }

    #[test]
    fn uncompilable_block_falls_back_to_the_interpreter() {
        let mut memory = memory(&[enc(SUBC, 1, 2, 3), enc(BC, 0, 0, 0)]);
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        ctx.regs[2] = 9;
        ctx.regs[3] = 4;
        let mut jit = Dispatcher::new(ToyFrontend::new(), plain());
        assert_eq!(jit.run(&mut ctx, &mut memory, 10), RunExit::InstructionFault { pc: 4 });
        assert_eq!(ctx.regs[1], 5);
        assert_eq!(jit.stats().fallbacks, 2);
    }

    #[test]
    fn guest_exception_stops_the_run() {
        let mut memory = memory(&[enc(LI, 1, 0, 1), enc(SYS, 0, 0, 0)]);
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        let mut jit = Dispatcher::new(ToyFrontend::new(), JitConfig::default());
        assert_eq!(
            jit.run(&mut ctx, &mut memory, 100),
            RunExit::Exception(GuestException { code: TOY_SYSCALL, pc: 4 })
        );
        assert_eq!(ctx.pc, 4);
    }
}
