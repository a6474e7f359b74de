//! Compiled units keyed by guest entry address, with direct block-to-block links and
//! invalidation by guest address range.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::bytecode::{Bytecode, ExitBlock};

/// Invalidation bookkeeping granularity, in bytes (log2)
pub const GRANULE_SHIFT: u32 = 6;

/// A handle to a cached block. Stale once the block is removed: the slot's generation moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    index: u32,
    generation: u32,
}

impl BlockId {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    pub fn to_bits(self) -> u64 {
        self.index as u64 | (self.generation as u64) << 32
    }

    /// Generations start at 1, so all-zero bits mean no block.
    pub fn from_bits(bits: u64) -> Option<BlockId> {
        let generation = (bits >> 32) as u32;
        (generation != 0).then_some(BlockId { index: bits as u32, generation })
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {}.{}", self.index, self.generation)
    }
}

/// One way out of a compiled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSite {
    /// Index of the exit record
    pub record: usize,
    /// Statically known destination; indirect exits have none and are never linked
    pub target: Option<u32>,
}

/// What the compiler hands to the cache.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub start: u32,
    pub code: Bytecode,
    pub exits: Vec<ExitSite>,
    /// Guest address ranges the unit was compiled from
    pub extents: Vec<Range<u32>>,
    pub cycles: u32,
    pub instruction_count: usize,
}

#[derive(Debug)]
pub struct JitBlock {
    pub id: BlockId,
    pub unit: CompiledUnit,
    /// Which block each exit currently enters directly
    pub links: Vec<Option<BlockId>>,
    pub run_count: u64,
}

impl JitBlock {
    pub fn start(&self) -> u32 {
        self.unit.start
    }

    pub fn overlaps(&self, range: &Range<u32>) -> bool {
        self.unit.extents.iter().any(|e| e.start < range.end && range.start < e.end)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub compiled: u64,
    pub invalidated: u64,
    pub links: u64,
    pub unlinks: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    block: Option<JitBlock>,
}

#[derive(Debug, Default)]
pub struct BlockCache {
    slots: Vec<Slot>,
    free: Vec<u32>,
    entries: HashMap<u32, BlockId>,
    /// Granule number to the blocks with code in it
    ranges: BTreeMap<u32, Vec<BlockId>>,
    /// Target address to the exits that lead there, linked or not
    links_to: HashMap<u32, Vec<(BlockId, u16)>>,
    stats: CacheStats,
}

fn granules(range: &Range<u32>) -> Option<std::ops::RangeInclusive<u32>> {
    if range.is_empty() {
        return None;
    }
    Some((range.start >> GRANULE_SHIFT)..=((range.end - 1) >> GRANULE_SHIFT))
}

impl BlockCache {
    pub fn new() -> Self {
        BlockCache::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn lookup(&self, address: u32) -> Option<BlockId> {
        self.entries.get(&address).copied()
    }

    pub fn get(&self, id: BlockId) -> Option<&JitBlock> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.block.as_ref()
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut JitBlock> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        slot.block.as_mut()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JitBlock> {
        self.slots.iter().filter_map(|slot| slot.block.as_ref())
    }

    /// Adds a unit, replacing any block already entered at the same address. The new block is
    /// not linked yet.
    pub fn insert(&mut self, unit: CompiledUnit) -> BlockId {
        let start = unit.start;
        if let Some(old) = self.lookup(start) {
            self.remove(old);
        }

        let id = match self.free.pop() {
            Some(index) => BlockId { index, generation: self.slots[index as usize].generation },
            None => {
                self.slots.push(Slot { generation: 1, block: None });
                BlockId { index: self.slots.len() as u32 - 1, generation: 1 }
            }
        };

        for extent in &unit.extents {
            for granule in granules(extent).into_iter().flatten() {
                let ids = self.ranges.entry(granule).or_default();
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        for (i, exit) in unit.exits.iter().enumerate() {
            if let Some(target) = exit.target {
                self.links_to.entry(target).or_default().push((id, i as u16));
            }
        }

        self.entries.insert(start, id);
        let links = vec![None; unit.exits.len()];
        self.slots[id.index()].block = Some(JitBlock { id, unit, links, run_count: 0 });
        self.stats.compiled += 1;
        log::trace!("cached {id} at {start:#010x}");
        id
    }

    /// Points exit `exit` of `from` at `to` (or back at the dispatcher) by patching its record.
    fn patch_exit(&mut self, from: BlockId, exit: usize, to: Option<BlockId>) {
        let Some(block) = self.get_mut(from) else {
            return;
        };
        let record = block.unit.exits[exit].record;
        let Some(mut op) = block.unit.code.read::<ExitBlock>(record) else {
            panic!("exit {exit} of {from} is not a direct exit record");
        };
        op.link = to;
        block.unit.code.patch(record, op);
        block.links[exit] = to;
    }

    /// Links `id`'s exits to blocks that already exist, and exits of other blocks that lead to
    /// `id`'s entry address to `id`.
    pub fn link(&mut self, id: BlockId) {
        self.link_outgoing(id);
        self.link_incoming(id);
    }

    pub fn link_outgoing(&mut self, id: BlockId) {
        let Some(block) = self.get(id) else {
            return;
        };
        let targets: Vec<(usize, BlockId)> = block
            .unit
            .exits
            .iter()
            .enumerate()
            .filter_map(|(i, exit)| Some((i, self.lookup(exit.target?)?)))
            .filter(|&(i, to)| block.links[i] != Some(to))
            .collect();
        for (exit, to) in targets {
            self.patch_exit(id, exit, Some(to));
            self.stats.links += 1;
        }
    }

    pub fn link_incoming(&mut self, id: BlockId) {
        let Some(start) = self.get(id).map(JitBlock::start) else {
            return;
        };
        let sources = self.links_to.get(&start).cloned().unwrap_or_default();
        for (from, exit) in sources {
            if self.get(from).is_some_and(|b| b.links[exit as usize] != Some(id)) {
                self.patch_exit(from, exit as usize, Some(id));
                self.stats.links += 1;
            }
        }
    }

    /// Destroys one block. Every exit linked into it goes back through the dispatcher.
    pub fn remove(&mut self, id: BlockId) -> Option<CompiledUnit> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let block = slot.block.take()?;
        // A slot whose generation would wrap is retired for good, so no old id can match it again
        match slot.generation.checked_add(1) {
            Some(next) => {
                slot.generation = next;
                self.free.push(id.index);
            }
            None => log::debug!("retiring slot {} after its last generation", id.index),
        }

        let start = block.start();
        if self.entries.get(&start) == Some(&id) {
            self.entries.remove(&start);
        }
        for extent in &block.unit.extents {
            for granule in granules(extent).into_iter().flatten() {
                if let Some(ids) = self.ranges.get_mut(&granule) {
                    ids.retain(|&other| other != id);
                    if ids.is_empty() {
                        self.ranges.remove(&granule);
                    }
                }
            }
        }
        for exit in &block.unit.exits {
            let Some(target) = exit.target else {
                continue;
            };
            if let Some(sources) = self.links_to.get_mut(&target) {
                sources.retain(|&(from, _)| from != id);
                if sources.is_empty() {
                    self.links_to.remove(&target);
                }
            }
        }

        let incoming: Vec<(BlockId, u16)> = self
            .links_to
            .get(&start)
            .into_iter()
            .flatten()
            .copied()
            .filter(|&(from, exit)| self.get(from).is_some_and(|b| b.links[exit as usize] == Some(id)))
            .collect();
        for (from, exit) in incoming {
            self.patch_exit(from, exit as usize, None);
            self.stats.unlinks += 1;
        }

        self.stats.invalidated += 1;
        Some(block.unit)
    }

    /// Destroys every block with code in `range`. Returns how many went.
    pub fn invalidate(&mut self, range: Range<u32>) -> usize {
        let Some(granules) = granules(&range) else {
            return 0;
        };
        let mut doomed: Vec<BlockId> = self
            .ranges
            .range(granules)
            .flat_map(|(_, ids)| ids.iter().copied())
            .filter(|&id| self.get(id).is_some_and(|b| b.overlaps(&range)))
            .collect();
        doomed.sort_unstable();
        doomed.dedup();

        for &id in &doomed {
            self.remove(id);
        }
        if !doomed.is_empty() {
            log::debug!("invalidated {} blocks in {:#010x}..{:#010x}", doomed.len(), range.start, range.end);
        }
        doomed.len()
    }

    pub fn clear(&mut self) {
        let ids: Vec<BlockId> = self.iter().map(|b| b.id).collect();
        for id in ids {
            self.remove(id);
        }
    }

    /// Checks the cross-references between the maps. Panics on the first inconsistency.
    pub fn verify(&self) {
        for (&address, &id) in &self.entries {
            let block = self.get(id).unwrap_or_else(|| panic!("entry {address:#010x} names dead {id}"));
            assert_eq!(block.start(), address);
        }
        for block in self.iter() {
            assert_eq!(self.lookup(block.start()), Some(block.id), "{} is not reachable by address", block.id);
            for (exit, link) in block.links.iter().enumerate() {
                if let Some(to) = link {
                    let target = self.get(*to).unwrap_or_else(|| panic!("{} exit {exit} links to dead {to}", block.id));
                    assert_eq!(Some(target.start()), block.unit.exits[exit].target);
                }
                let record = block.unit.exits[exit].record;
                if let Some(op) = block.unit.code.read::<ExitBlock>(record) {
                    assert_eq!(op.link, *link, "{} exit {exit} record disagrees with its link", block.id);
                }
            }
            for extent in &block.unit.extents {
                for granule in granules(extent).into_iter().flatten() {
                    assert!(
                        self.ranges.get(&granule).is_some_and(|ids| ids.contains(&block.id)),
                        "{} missing from granule {granule:#x}", block.id
                    );
                }
            }
        }
        for ids in self.ranges.values() {
            for &id in ids {
                assert!(self.contains(id), "range map names dead {id}");
            }
        }
    }
}

/// Address ranges written behind the core's back (DMA, other threads), applied at the next
/// block boundary.
#[derive(Debug)]
pub struct InvalidationQueue {
    tx: Sender<Range<u32>>,
    rx: Receiver<Range<u32>>,
}

#[derive(Debug, Clone)]
pub struct InvalidationHandle {
    tx: Sender<Range<u32>>,
}

impl InvalidationHandle {
    /// Returns false once the core is gone.
    pub fn invalidate(&self, range: Range<u32>) -> bool {
        self.tx.send(range).is_ok()
    }
}

impl Default for InvalidationQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel();
        InvalidationQueue { tx, rx }
    }
}

impl InvalidationQueue {
    pub fn new() -> Self {
        InvalidationQueue::default()
    }

    pub fn handle(&self) -> InvalidationHandle {
        InvalidationHandle { tx: self.tx.clone() }
    }

    pub fn drain(&self) -> impl Iterator<Item = Range<u32>> + '_ {
        self.rx.try_iter()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::arch::OpInfo;
    use crate::block::{CodeBlock, CodeOp};

    /// A unit at `start` covering `len` instructions, with one direct exit per target.
    fn unit(start: u32, len: u32, targets: &[u32]) -> CompiledUnit {
        let mut code = Bytecode::new();
        let mut exits = Vec::new();
        for (i, &target) in targets.iter().enumerate() {
            let record = code.push(ExitBlock { pc: target, cycles: len, exit: i as u16, idle: false, link: None });
            exits.push(ExitSite { record, target: Some(target) });
        }
        CompiledUnit {
            start,
            code,
            exits,
            extents: vec![start..start + len * 4],
            cycles: len,
            instruction_count: len as usize,
        }
    }

    fn link_of(cache: &BlockCache, id: BlockId, exit: usize) -> Option<BlockId> {
        let block = cache.get(id).unwrap();
        let op = block.unit.code.read::<ExitBlock>(block.unit.exits[exit].record).unwrap();
        assert_eq!(op.link, block.links[exit]);
        op.link
    }

    #[test]
    fn block_id_bits() {
        let id = BlockId { index: 7, generation: 3 };
        assert_eq!(BlockId::from_bits(id.to_bits()), Some(id));
        assert_eq!(BlockId::from_bits(0), None);
    }

    #[test]
    fn links_both_directions() {
        let mut cache = BlockCache::new();
        let a = cache.insert(unit(0x100, 4, &[0x200]));
        cache.link(a);
        assert_eq!(link_of(&cache, a, 0), None);

        let b = cache.insert(unit(0x200, 2, &[0x100]));
        cache.link(b);
        assert_eq!(link_of(&cache, a, 0), Some(b));
        assert_eq!(link_of(&cache, b, 0), Some(a));
        assert_eq!(cache.stats().links, 2);
        cache.verify();
    }

    #[test]
    fn invalidation_unlinks_and_stales_ids() {
        let mut cache = BlockCache::new();
        let a = cache.insert(unit(0x100, 4, &[0x200]));
        let b = cache.insert(unit(0x200, 2, &[0x100]));
        cache.link(a);
        cache.link(b);

        assert_eq!(cache.invalidate(0x204..0x208), 1);
        assert!(!cache.contains(b));
        assert_eq!(cache.lookup(0x200), None);
        assert_eq!(link_of(&cache, a, 0), None);
        cache.verify();

        // The freed slot comes back under a new generation
        let c = cache.insert(unit(0x200, 2, &[]));
        assert_eq!(c.index(), b.index());
        assert_ne!(c, b);
        assert!(cache.get(b).is_none());
        cache.link(c);
        assert_eq!(link_of(&cache, a, 0), Some(c));
        cache.verify();
    }

    #[test]
    fn exhausted_slot_is_never_reused() {
        let mut cache = BlockCache::new();
        cache.slots.push(Slot { generation: u32::MAX, block: None });
        cache.free.push(0);

        let last = cache.insert(unit(0x100, 1, &[]));
        assert_eq!((last.index(), last.generation()), (0, u32::MAX));
        assert_eq!(cache.invalidate(0x100..0x104), 1);

        let next = cache.insert(unit(0x100, 1, &[]));
        assert_eq!(next.index(), 1);
        assert!(cache.get(last).is_none());
        assert!(cache.free.is_empty());
        cache.verify();
    }

    #[test]
    fn block_in_the_last_word_can_be_invalidated() {
        let mut block = CodeBlock::<u32>::new(0xffff_fffc, 1, 1);
        block.ops.push(CodeOp::new(0, 0xffff_fffc, &OpInfo::new("nop")));

        let mut cache = BlockCache::new();
        let mut top = unit(0xffff_fffc, 0, &[]);
        top.extents = block.extents(4);
        cache.insert(top);
        assert_eq!(cache.invalidate(0xffff_fffc..u32::MAX), 1);
        assert_eq!(cache.lookup(0xffff_fffc), None);
        cache.verify();
    }

    #[test]
    fn range_outside_every_extent_keeps_blocks() {
        let mut cache = BlockCache::new();
        cache.insert(unit(0x100, 4, &[]));
        // Same granule, no overlap
        assert_eq!(cache.invalidate(0x110..0x120), 0);
        assert_eq!(cache.invalidate(0x10c..0x10c), 0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate(0x10c..0x110), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn reinsert_replaces() {
        let mut cache = BlockCache::new();
        let a = cache.insert(unit(0x100, 1, &[0x100]));
        cache.link(a);
        assert_eq!(link_of(&cache, a, 0), Some(a));

        let b = cache.insert(unit(0x100, 2, &[]));
        assert!(!cache.contains(a));
        assert_eq!(cache.lookup(0x100), Some(b));
        assert_eq!(cache.len(), 1);
        cache.verify();
    }

    #[test]
    fn queued_invalidations_drain_in_order() {
        let queue = InvalidationQueue::new();
        let handle = queue.handle();
        let worker = std::thread::spawn(move || {
            assert!(handle.invalidate(0..4));
            assert!(handle.invalidate(8..12));
        });
        worker.join().unwrap();
        assert_eq!(queue.drain().collect::<Vec<_>>(), vec![0..4, 8..12]);
        assert_eq!(queue.drain().count(), 0);
    }

    #[derive(Debug, Clone)]
    enum Action {
        Insert { start: u32, len: u32, targets: Vec<u32> },
        Invalidate { start: u32, len: u32 },
    }

    fn action() -> impl Strategy<Value = Action> {
        let address = (0u32..32).prop_map(|i| i * 16);
        prop_oneof![
            (address.clone(), 1u32..8, proptest::collection::vec(address.clone(), 0..3))
                .prop_map(|(start, len, targets)| Action::Insert { start, len, targets }),
            (address, 1u32..64).prop_map(|(start, len)| Action::Invalidate { start, len }),
        ]
    }

    proptest! {
        #[test]
        fn maps_stay_consistent(actions in proptest::collection::vec(action(), 1..40)) {
            let mut cache = BlockCache::new();
            for action in actions {
                match action {
                    Action::Insert { start, len, targets } => {
                        let id = cache.insert(unit(start, len, &targets));
                        cache.link(id);
                    }
                    Action::Invalidate { start, len } => {
                        let range = start..start + len;
                        cache.invalidate(range.clone());
                        prop_assert!(cache.iter().all(|b| !b.overlaps(&range)));
                    }
                }
                cache.verify();
            }
        }
    }
}
