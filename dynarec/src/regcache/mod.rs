//! Compile-time model of where every guest register lives while a block is being generated.
//!
//! The cache never produces code itself. Every load, store and move it decides on is requested
//! from an [`Emitter`], so the same bookkeeping drives any backend. A register is either in its
//! guest-context slot ([`Location::Memory`]) or held in a host register, possibly with a newer
//! value than memory (`dirty`). Sub-register views (a 16-bit half of a 40-bit accumulator, say)
//! own no storage: taking one materializes its parent and reports where inside it the view lies.
//!
//! Where control flow splits inside a block, [`RegCache::fork`] clones the state for one arm and
//! [`RegCache::flush_regs`] emits the moves that make it agree with the other arm again.

use std::fmt;

use log::trace;

use crate::regset::RegSet;

mod eviction;

pub use eviction::{DeadFirst, EvictionCandidate, EvictionPolicy, OldestUse};

/// Index of a guest register in a [`RegLayout`]
pub type GuestReg = usize;

/// Upper bound on host registers a [`HostConfig`] can describe
pub const MAX_HOST_REGS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostReg(pub u8);

impl HostReg {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HostReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegKind {
    /// Owns a guest-context slot
    Primary { slot: u16, bits: u8 },
    /// `width` bits of `parent` starting at bit `shift`
    View { parent: GuestReg, shift: u8, width: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegDesc {
    pub name: &'static str,
    pub kind: RegKind,
    /// Host register this primary permanently lives in once loaded
    pub pinned: Option<HostReg>,
}

/// Static description of the guest registers a cache manages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegLayout {
    regs: Vec<RegDesc>,
}

impl RegLayout {
    pub fn new() -> Self {
        RegLayout::default()
    }

    pub fn primary(mut self, name: &'static str, slot: u16, bits: u8) -> Self {
        assert!((1..=64).contains(&bits), "{name}: primary registers are 1 to 64 bits wide");
        self.regs.push(RegDesc { name, kind: RegKind::Primary { slot, bits }, pinned: None });
        self
    }

    pub fn view(mut self, name: &'static str, parent: GuestReg, shift: u8, width: u8) -> Self {
        match self.regs.get(parent).map(|desc| desc.kind) {
            Some(RegKind::Primary { bits, .. }) => {
                assert!(width > 0 && shift as u32 + width as u32 <= bits as u32,
                    "{name}: view {width}@{shift} does not fit its parent");
            }
            _ => panic!("{name}: the parent of a view must be a primary register"),
        }
        self.regs.push(RegDesc { name, kind: RegKind::View { parent, shift, width }, pinned: None });
        self
    }

    pub fn pin(mut self, reg: GuestReg, host: HostReg) -> Self {
        assert!(matches!(self.regs[reg].kind, RegKind::Primary { .. }), "only primary registers can be pinned");
        assert!(
            self.regs.iter().all(|desc| desc.pinned != Some(host)),
            "{host} is already pinned"
        );
        self.regs[reg].pinned = Some(host);
        self
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn get(&self, reg: GuestReg) -> &RegDesc {
        &self.regs[reg]
    }

    /// The primary register backing `reg`, and where inside it `reg` lies
    pub fn resolve(&self, reg: GuestReg) -> (GuestReg, u8, u8) {
        match self.regs[reg].kind {
            RegKind::Primary { bits, .. } => (reg, 0, bits),
            RegKind::View { parent, shift, width } => (parent, shift, width),
        }
    }

    fn slot(&self, primary: GuestReg) -> u16 {
        match self.regs[primary].kind {
            RegKind::Primary { slot, .. } => slot,
            RegKind::View { .. } => unreachable!("views have no slot"),
        }
    }

    fn bits(&self, primary: GuestReg) -> u8 {
        self.resolve(primary).2
    }

    fn is_primary(&self, reg: GuestReg) -> bool {
        matches!(self.regs[reg].kind, RegKind::Primary { .. })
    }
}

/// The host registers available to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    count: u8,
    callee_saved: u8,
}

impl HostConfig {
    /// `count` registers `h0..`, of which those in `callee_saved` survive runtime calls.
    pub fn new(count: usize, callee_saved: &[u8]) -> Self {
        assert!(count <= MAX_HOST_REGS, "at most {MAX_HOST_REGS} host registers");
        let mut mask = 0u8;
        for &reg in callee_saved {
            assert!((reg as usize) < count, "h{reg} is not one of the {count} host registers");
            mask |= 1 << reg;
        }
        HostConfig { count: count as u8, callee_saved: mask }
    }

    pub fn count(&self) -> usize {
        self.count as usize
    }

    pub fn is_callee_saved(&self, reg: HostReg) -> bool {
        self.callee_saved & (1 << reg.0) != 0
    }

    /// Registers a runtime call may clobber
    pub fn caller_saved_mask(&self) -> u8 {
        let all = if self.count as usize == MAX_HOST_REGS { u8::MAX } else { (1u8 << self.count) - 1 };
        all & !self.callee_saved
    }
}

/// Data movement the cache asks a backend to perform.
pub trait Emitter {
    fn load_slot(&mut self, dst: HostReg, slot: u16);
    fn store_slot(&mut self, slot: u16, src: HostReg);
    fn mov(&mut self, dst: HostReg, src: HostReg);
    /// `dst = (src >> shift) & mask(width)`, sign-extended when `signed`
    fn extract(&mut self, dst: HostReg, src: HostReg, shift: u8, width: u8, signed: bool);
    /// Replaces bits `shift..shift + width` of `dst` with the low bits of `src`
    fn insert(&mut self, dst: HostReg, src: HostReg, shift: u8, width: u8);
    fn push(&mut self, src: HostReg);
    fn pop(&mut self, dst: HostReg);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Only the guest-context slot holds the value
    Memory,
    Host { host: HostReg, shift: u8, width: u8 },
    /// A view, which owns no storage
    Unallocated,
}

impl Location {
    pub fn host(self) -> Option<HostReg> {
        match self {
            Location::Host { host, .. } => Some(host),
            _ => None,
        }
    }
}

/// Where a taken register can be accessed until it is put back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostOperand {
    pub host: HostReg,
    pub shift: u8,
    pub width: u8,
    /// The operand covers every bit of its host register's value
    pub full: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Write back and give up every host register not pinned
    Full,
    /// Write back and keep the now clean host copies
    KeepResident,
    /// Only emit the stores; the state stays as is for the path that skips them
    MaintainState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicReg {
    location: Location,
    dirty: bool,
    locked: bool,
    /// Allocated without loading; must be written before being put back
    unloaded: bool,
    last_use: u64,
}

impl DynamicReg {
    pub fn location(&self) -> Location { self.location }
    pub fn is_dirty(&self) -> bool { self.dirty }
    pub fn is_locked(&self) -> bool { self.locked }
    pub fn last_use(&self) -> u64 { self.last_use }

    /// Holds a host register
    pub fn is_used(&self) -> bool {
        matches!(self.location, Location::Host { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostRegSlot {
    owner: Option<GuestReg>,
    reserved: bool,
    pushed: bool,
    callee_saved: bool,
    pinned: bool,
}

impl HostRegSlot {
    pub fn owner(&self) -> Option<GuestReg> { self.owner }
    pub fn is_reserved(&self) -> bool { self.reserved }
    pub fn is_pushed(&self) -> bool { self.pushed }
    pub fn is_callee_saved(&self) -> bool { self.callee_saved }
    pub fn is_pinned(&self) -> bool { self.pinned }

    fn is_free(&self) -> bool {
        self.owner.is_none() && !self.reserved && !self.pinned
    }
}

#[derive(Clone)]
pub struct RegCache<P: EvictionPolicy = OldestUse> {
    layout: RegLayout,
    regs: Vec<DynamicReg>,
    host: Vec<HostRegSlot>,
    use_counter: u64,
    live_hint: RegSet,
    policy: P,
    /// A fork that still has to be merged or discarded
    pending_merge: bool,
}

impl<P: EvictionPolicy + Default> RegCache<P> {
    pub fn new(layout: &RegLayout, config: &HostConfig) -> Self {
        Self::with_policy(layout, config, P::default())
    }
}

impl<P: EvictionPolicy> RegCache<P> {
    pub fn with_policy(layout: &RegLayout, config: &HostConfig, policy: P) -> Self {
        let mut host: Vec<HostRegSlot> = (0..config.count())
            .map(|i| HostRegSlot {
                callee_saved: config.is_callee_saved(HostReg(i as u8)),
                ..Default::default()
            })
            .collect();

        let regs = layout
            .regs
            .iter()
            .map(|desc| {
                if let Some(pin) = desc.pinned {
                    assert!(pin.index() < host.len(), "{}: {pin} is not a host register", desc.name);
                    host[pin.index()].pinned = true;
                }
                DynamicReg {
                    location: match desc.kind {
                        RegKind::Primary { .. } => Location::Memory,
                        RegKind::View { .. } => Location::Unallocated,
                    },
                    dirty: false,
                    locked: false,
                    unloaded: false,
                    last_use: 0,
                }
            })
            .collect();

        RegCache {
            layout: layout.clone(),
            regs,
            host,
            use_counter: 0,
            live_hint: RegSet::EMPTY,
            policy,
            pending_merge: false,
        }
    }

    pub fn layout(&self) -> &RegLayout {
        &self.layout
    }

    pub fn reg(&self, reg: GuestReg) -> &DynamicReg {
        &self.regs[reg]
    }

    pub fn host_slot(&self, host: HostReg) -> &HostRegSlot {
        &self.host[host.index()]
    }

    /// Where `reg` is right now, without side effects. Views report their parent's host register.
    pub fn location(&self, reg: GuestReg) -> Location {
        let (primary, shift, width) = self.layout.resolve(reg);
        match self.regs[primary].location {
            Location::Host { host, .. } => Location::Host { host, shift, width },
            other => other,
        }
    }

    pub fn is_dirty(&self, reg: GuestReg) -> bool {
        self.regs[self.layout.resolve(reg).0].dirty
    }

    pub fn owner(&self, host: HostReg) -> Option<GuestReg> {
        self.host[host.index()].owner
    }

    /// Registers a later instruction still reads; eviction policies may prefer the others
    pub fn set_live_hint(&mut self, live: RegSet) {
        self.live_hint = live;
    }

    fn name(&self, reg: GuestReg) -> &'static str {
        self.layout.get(reg).name
    }

    fn touch(&mut self, primary: GuestReg) {
        self.use_counter += 1;
        self.regs[primary].last_use = self.use_counter;
    }

    fn set_host(&mut self, primary: GuestReg, host: HostReg) {
        let width = self.layout.bits(primary);
        self.regs[primary].location = Location::Host { host, shift: 0, width };
        self.host[host.index()].owner = Some(primary);
    }

    /// Brings `reg` into a host register and locks it for the current instruction.
    ///
    /// With `load == false` the caller promises to overwrite the whole register before
    /// putting it back dirty. Views always load, their parent's other bits must survive.
    pub fn get_location(&mut self, emit: &mut dyn Emitter, reg: GuestReg, load: bool) -> HostOperand {
        let (primary, shift, width) = self.layout.resolve(reg);
        assert!(!self.regs[primary].locked, "{} is already taken by this instruction", self.name(reg));

        let bits = self.layout.bits(primary);
        let full = width == bits;
        let host = match self.regs[primary].location {
            Location::Host { host, .. } => host,
            _ => {
                let host = self.allocate(emit, primary);
                if load || !full {
                    emit.load_slot(host, self.layout.slot(primary));
                } else {
                    self.regs[primary].unloaded = true;
                }
                self.set_host(primary, host);
                host
            }
        };

        self.regs[primary].locked = true;
        self.touch(primary);
        HostOperand { host, shift, width, full }
    }

    /// Ends the current instruction's use of `reg`. `dirty` records that it was written.
    pub fn put_back(&mut self, reg: GuestReg, dirty: bool) {
        let (primary, ..) = self.layout.resolve(reg);
        let name = self.name(reg);
        let r = &mut self.regs[primary];
        assert!(r.locked, "{name} was put back without being taken");
        assert!(dirty || !r.unloaded, "{name} was taken without loading and must be written");
        r.locked = false;
        r.unloaded = false;
        r.dirty |= dirty;
    }

    /// Copies `reg` into `dst`, extracting it when it is a view.
    pub fn read_into(&mut self, emit: &mut dyn Emitter, reg: GuestReg, dst: HostReg, signed: bool) {
        let op = self.get_location(emit, reg, true);
        if op.full {
            if op.host != dst {
                emit.mov(dst, op.host);
            }
        } else {
            emit.extract(dst, op.host, op.shift, op.width, signed);
        }
        self.put_back(reg, false);
    }

    /// Writes `src` to `reg`. A view only replaces its own bits of the parent.
    pub fn write_from(&mut self, emit: &mut dyn Emitter, reg: GuestReg, src: HostReg) {
        let op = self.get_location(emit, reg, false);
        if op.full {
            emit.mov(op.host, src);
        } else {
            emit.insert(op.host, src, op.shift, op.width);
        }
        self.put_back(reg, true);
    }

    fn allocate(&mut self, emit: &mut dyn Emitter, primary: GuestReg) -> HostReg {
        if let Some(pin) = self.layout.get(primary).pinned {
            return pin;
        }
        match self.find_free_host_reg() {
            Some(host) => host,
            None => self.evict(emit, |_| true),
        }
    }

    /// An unowned, unreserved, unpinned host register, if any.
    pub fn find_free_host_reg(&self) -> Option<HostReg> {
        self.host
            .iter()
            .position(HostRegSlot::is_free)
            .map(|i| HostReg(i as u8))
    }

    fn evict(&mut self, emit: &mut dyn Emitter, allowed: impl Fn(HostReg) -> bool) -> HostReg {
        let candidates: Vec<EvictionCandidate> = self
            .host
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let reg = slot.owner?;
                let host = HostReg(i as u8);
                let r = &self.regs[reg];
                if slot.reserved || slot.pinned || r.locked || !allowed(host) {
                    return None;
                }
                Some(EvictionCandidate {
                    reg,
                    host,
                    last_use: r.last_use,
                    dirty: r.dirty,
                    live: self.live_hint.contains(reg),
                })
            })
            .collect();

        let Some(victim) = self.policy.choose(&candidates) else {
            panic!("no host register can be evicted: every candidate is locked, pinned or reserved");
        };
        let Some(host) = self.regs[victim].location.host() else {
            panic!("eviction policy chose {}, which holds no host register", self.name(victim));
        };
        trace!("evicting {} from {host}", self.name(victim));
        self.drop_host(emit, victim, true);
        host
    }

    /// Moves `primary` out of its host register, storing it first if asked and dirty.
    fn drop_host(&mut self, emit: &mut dyn Emitter, primary: GuestReg, store: bool) {
        let Location::Host { host, .. } = self.regs[primary].location else {
            return;
        };
        if store && self.regs[primary].dirty {
            emit.store_slot(self.layout.slot(primary), host);
        }
        let r = &mut self.regs[primary];
        r.location = Location::Memory;
        r.dirty = false;
        self.host[host.index()].owner = None;
    }

    /// Takes a free host register as scratch, evicting if needed.
    pub fn get_free_host_reg(&mut self, emit: &mut dyn Emitter) -> HostReg {
        let host = match self.find_free_host_reg() {
            Some(host) => host,
            None => self.evict(emit, |_| true),
        };
        self.host[host.index()].reserved = true;
        host
    }

    /// Claims a specific host register as scratch, evicting its owner.
    pub fn reserve(&mut self, emit: &mut dyn Emitter, host: HostReg) {
        let slot = &self.host[host.index()];
        assert!(!slot.reserved, "{host} is already reserved");
        assert!(!slot.pinned, "{host} is pinned");
        if let Some(owner) = slot.owner {
            assert!(!self.regs[owner].locked, "{host} holds {}, which is taken", self.name(owner));
            self.drop_host(emit, owner, true);
        }
        self.host[host.index()].reserved = true;
    }

    pub fn release(&mut self, host: HostReg) {
        let slot = &mut self.host[host.index()];
        assert!(slot.reserved, "{host} was not reserved");
        slot.reserved = false;
    }

    pub fn reserved(&self) -> impl Iterator<Item = HostReg> + '_ {
        self.host
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.reserved)
            .map(|(i, _)| HostReg(i as u8))
    }

    /// Makes the value in `host` survive a runtime call, moving it to a callee-saved register
    /// if needed. Returns where it lives afterwards.
    pub fn make_abi_call_safe(&mut self, emit: &mut dyn Emitter, host: HostReg) -> HostReg {
        let slot = self.host[host.index()].clone();
        if slot.callee_saved {
            return host;
        }
        assert!(!slot.pinned, "{host} is pinned and cannot move");
        if let Some(owner) = slot.owner {
            assert!(!self.regs[owner].locked, "{} is taken and cannot move", self.name(owner));
        }

        let target = match self.host.iter().position(|s| s.callee_saved && s.is_free()) {
            Some(i) => HostReg(i as u8),
            None => {
                let callee: Vec<bool> = self.host.iter().map(|s| s.callee_saved).collect();
                self.evict(emit, move |h| callee[h.index()])
            }
        };

        emit.mov(target, host);
        if let Some(owner) = slot.owner {
            self.host[host.index()].owner = None;
            self.set_host(owner, target);
        }
        if slot.reserved {
            self.host[host.index()].reserved = false;
            self.host[target.index()].reserved = true;
        }
        target
    }

    /// Saves every occupied caller-saved host register before a runtime call.
    pub fn save_caller_saved(&mut self, emit: &mut dyn Emitter) {
        for (i, slot) in self.host.iter_mut().enumerate() {
            if !slot.callee_saved && !slot.pushed && (slot.owner.is_some() || slot.reserved) {
                emit.push(HostReg(i as u8));
                slot.pushed = true;
            }
        }
    }

    pub fn restore_caller_saved(&mut self, emit: &mut dyn Emitter) {
        for (i, slot) in self.host.iter_mut().enumerate().rev() {
            if slot.pushed {
                emit.pop(HostReg(i as u8));
                slot.pushed = false;
            }
        }
    }

    /// Writes `reg` back if dirty; it stays resident and becomes clean.
    pub fn flush(&mut self, emit: &mut dyn Emitter, reg: GuestReg) {
        let (primary, ..) = self.layout.resolve(reg);
        if let Location::Host { host, .. } = self.regs[primary].location {
            if self.regs[primary].dirty {
                emit.store_slot(self.layout.slot(primary), host);
                self.regs[primary].dirty = false;
            }
        }
    }

    /// Writes `reg` back if dirty and frees its host register. Pinned registers stay resident.
    pub fn spill(&mut self, emit: &mut dyn Emitter, reg: GuestReg) {
        let (primary, ..) = self.layout.resolve(reg);
        assert!(!self.regs[primary].locked, "{} is taken and cannot be spilled", self.name(reg));
        if self.layout.get(primary).pinned.is_some() {
            self.flush(emit, primary);
        } else {
            self.drop_host(emit, primary, true);
        }
    }

    /// Forgets the host copy of `reg` without writing it back, because something else is
    /// about to overwrite the guest-context slot.
    pub fn discard(&mut self, reg: GuestReg) {
        let (primary, ..) = self.layout.resolve(reg);
        assert!(!self.regs[primary].locked, "{} is taken and cannot be discarded", self.name(reg));
        let Location::Host { host, .. } = self.regs[primary].location else {
            return;
        };
        let r = &mut self.regs[primary];
        r.location = Location::Memory;
        r.dirty = false;
        self.host[host.index()].owner = None;
    }

    pub fn flush_all(&mut self, emit: &mut dyn Emitter, mode: FlushMode) {
        for primary in 0..self.regs.len() {
            if !self.layout.is_primary(primary) {
                continue;
            }
            let Location::Host { host, .. } = self.regs[primary].location else {
                continue;
            };
            // Fault paths store state in the middle of an instruction; taken registers still
            // hold their values from before it.
            assert!(
                mode == FlushMode::MaintainState || !self.regs[primary].locked,
                "{} is taken during a flush", self.name(primary)
            );
            if self.regs[primary].dirty {
                emit.store_slot(self.layout.slot(primary), host);
            }
            match mode {
                FlushMode::MaintainState => {}
                FlushMode::KeepResident => self.regs[primary].dirty = false,
                FlushMode::Full => {
                    if self.layout.get(primary).pinned.is_some() {
                        self.regs[primary].dirty = false;
                    } else {
                        self.drop_host(emit, primary, false);
                    }
                }
            }
        }
    }

    /// Loads every pinned register into its host register.
    pub fn load_all(&mut self, emit: &mut dyn Emitter) {
        for primary in 0..self.regs.len() {
            let Some(pin) = self.layout.get(primary).pinned else {
                continue;
            };
            if self.regs[primary].location == Location::Memory {
                emit.load_slot(pin, self.layout.slot(primary));
                self.set_host(primary, pin);
            }
        }
    }

    /// A copy of the current state for compiling a divergent arm. The copy must end in
    /// [`flush_regs`](Self::flush_regs), [`discard_arm`](Self::discard_arm) or
    /// [`continue_unmerged`](Self::continue_unmerged).
    pub fn fork(&self) -> Self {
        let mut arm = self.clone();
        arm.pending_merge = true;
        arm
    }

    /// Drops an arm whose code path never reaches a merge point (it left the block).
    pub fn discard_arm(mut self) {
        self.pending_merge = false;
    }

    /// Keeps using a forked state on its own, because the other arm left the block.
    pub fn continue_unmerged(&mut self) {
        self.pending_merge = false;
    }

    /// Emits whatever makes this state identical to `target`, for the end of an arm that
    /// rejoins code compiled under `target`.
    pub fn flush_regs(&mut self, emit: &mut dyn Emitter, target: &RegCache<P>) {
        assert_eq!(self.layout, target.layout, "merging caches of different layouts");
        for reg in 0..self.regs.len() {
            assert!(
                !self.regs[reg].locked && !target.regs[reg].locked,
                "{} is taken at a merge point", self.name(reg)
            );
        }
        for (mine, theirs) in self.host.iter().zip(&target.host) {
            assert_eq!(mine.reserved, theirs.reserved, "scratch reservations differ at a merge point");
            assert!(!mine.pushed && !theirs.pushed, "registers are still pushed at a merge point");
        }

        let primaries: Vec<GuestReg> = (0..self.regs.len()).filter(|&r| self.layout.is_primary(r)).collect();

        // Values the target keeps in memory
        for &reg in &primaries {
            if self.regs[reg].is_used() && target.regs[reg].location == Location::Memory {
                self.drop_host(emit, reg, true);
            }
        }

        // Values in the wrong host register; a cycle is broken by spilling one member
        loop {
            let mut progress = false;
            let mut blocked = None;
            for &reg in &primaries {
                let (Location::Host { host: from, .. }, Location::Host { host: to, .. }) =
                    (self.regs[reg].location, target.regs[reg].location)
                else {
                    continue;
                };
                if from == to {
                    continue;
                }
                if self.host[to.index()].owner.is_none() {
                    emit.mov(to, from);
                    self.host[from.index()].owner = None;
                    self.set_host(reg, to);
                    progress = true;
                } else {
                    blocked.get_or_insert(reg);
                }
            }
            match (progress, blocked) {
                (true, _) => continue,
                (false, Some(reg)) => self.drop_host(emit, reg, true),
                (false, None) => break,
            }
        }

        // Values the target has in a host register but this state does not
        for &reg in &primaries {
            if let (Location::Memory, Location::Host { host, .. }) =
                (self.regs[reg].location, target.regs[reg].location)
            {
                debug_assert!(self.host[host.index()].owner.is_none());
                emit.load_slot(host, self.layout.slot(reg));
                self.set_host(reg, host);
            }
        }

        for &reg in &primaries {
            let Location::Host { host, .. } = self.regs[reg].location else {
                continue;
            };
            match (self.regs[reg].dirty, target.regs[reg].dirty) {
                (true, false) => {
                    emit.store_slot(self.layout.slot(reg), host);
                    self.regs[reg].dirty = false;
                }
                // Memory already holds the value, so calling it dirty only costs a later store
                (false, true) => self.regs[reg].dirty = true,
                _ => {}
            }
        }

        for (mine, theirs) in self.regs.iter_mut().zip(&target.regs) {
            mine.last_use = theirs.last_use;
            mine.unloaded = false;
        }
        self.use_counter = target.use_counter;
        self.pending_merge = false;

        self.assert_compatible(target);
    }

    pub fn is_compatible(&self, other: &RegCache<P>) -> bool {
        self.regs.len() == other.regs.len()
            && self.regs.iter().zip(&other.regs).all(|(a, b)| a.location == b.location && a.dirty == b.dirty)
            && self.host.iter().zip(&other.host).all(|(a, b)| a.owner == b.owner && a.reserved == b.reserved)
    }

    pub fn assert_compatible(&self, other: &RegCache<P>) {
        for (reg, (a, b)) in self.regs.iter().zip(&other.regs).enumerate() {
            assert_eq!(
                (a.location, a.dirty),
                (b.location, b.dirty),
                "{} differs between the merged states", self.name(reg)
            );
        }
        assert!(self.is_compatible(other), "host register ownership differs between the merged states");
    }
}

impl<P: EvictionPolicy> Drop for RegCache<P> {
    fn drop(&mut self) {
        if cfg!(debug_assertions) && self.pending_merge && !std::thread::panicking() {
            panic!("forked register cache dropped without being merged or discarded");
        }
    }
}

impl<P: EvictionPolicy> fmt::Debug for RegCache<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (reg, r) in self.regs.iter().enumerate() {
            if let Location::Host { host, .. } = r.location {
                map.entry(&self.name(reg), &format_args!("{host}{}", if r.dirty { "*" } else { "" }));
            }
        }
        map.finish()
    }
}
