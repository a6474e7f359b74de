use super::{GuestReg, HostReg};

/// A guest register that currently occupies an evictable host register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub reg: GuestReg,
    pub host: HostReg,
    pub last_use: u64,
    /// Evicting it costs a store
    pub dirty: bool,
    /// A later instruction of the block still reads it
    pub live: bool,
}

/// Picks which register gives up its host register when none is free.
pub trait EvictionPolicy: Clone {
    fn choose(&self, candidates: &[EvictionCandidate]) -> Option<GuestReg>;
}

/// Least recently used, ties broken by the lowest guest register index.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestUse;

impl EvictionPolicy for OldestUse {
    fn choose(&self, candidates: &[EvictionCandidate]) -> Option<GuestReg> {
        candidates
            .iter()
            .min_by_key(|c| (c.last_use, c.reg))
            .map(|c| c.reg)
    }
}

/// Prefers values no later instruction needs, then values that need no store, then the oldest.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadFirst;

impl EvictionPolicy for DeadFirst {
    fn choose(&self, candidates: &[EvictionCandidate]) -> Option<GuestReg> {
        candidates
            .iter()
            .min_by_key(|c| (c.live, c.dirty, c.last_use, c.reg))
            .map(|c| c.reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(reg: GuestReg, last_use: u64, dirty: bool, live: bool) -> EvictionCandidate {
        EvictionCandidate { reg, host: HostReg(reg as u8), last_use, dirty, live }
    }

    #[test]
    fn oldest_use_breaks_ties_by_index() {
        let candidates = [candidate(4, 7, false, true), candidate(2, 7, true, true), candidate(3, 9, false, false)];
        assert_eq!(OldestUse.choose(&candidates), Some(2));
        assert_eq!(OldestUse.choose(&[]), None);
    }

    #[test]
    fn dead_first_prefers_dead_then_clean() {
        let candidates = [candidate(1, 1, false, true), candidate(2, 5, true, false), candidate(3, 9, false, false)];
        assert_eq!(DeadFirst.choose(&candidates), Some(3));
    }
}
