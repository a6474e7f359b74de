use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not, Sub};

/// Set of guest register indices within one register file (at most 64 registers).
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct RegSet(u64);

impl RegSet {
    pub const EMPTY: RegSet = RegSet(0);

    pub const fn from_bits(bits: u64) -> Self {
        RegSet(bits)
    }

    /// Every register below `count`
    pub const fn all(count: usize) -> Self {
        if count >= 64 {
            RegSet(!0)
        } else {
            RegSet((1u64 << count) - 1)
        }
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn with(self, reg: usize) -> Self {
        RegSet(self.0 | (1 << reg))
    }

    pub fn contains(self, reg: usize) -> bool {
        reg < 64 && self.0 & (1 << reg) != 0
    }

    pub fn insert(&mut self, reg: usize) {
        assert!(reg < 64, "register index {reg} out of range");
        self.0 |= 1 << reg;
    }

    pub fn remove(&mut self, reg: usize) {
        if reg < 64 {
            self.0 &= !(1 << reg);
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn intersects(self, other: RegSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let reg = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(reg)
        })
    }
}

impl FromIterator<usize> for RegSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut set = RegSet::EMPTY;
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

impl BitOr for RegSet {
    type Output = RegSet;
    fn bitor(self, rhs: Self) -> RegSet { RegSet(self.0 | rhs.0) }
}

impl BitOrAssign for RegSet {
    fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0 }
}

impl BitAnd for RegSet {
    type Output = RegSet;
    fn bitand(self, rhs: Self) -> RegSet { RegSet(self.0 & rhs.0) }
}

impl BitAndAssign for RegSet {
    fn bitand_assign(&mut self, rhs: Self) { self.0 &= rhs.0 }
}

impl Sub for RegSet {
    type Output = RegSet;
    fn sub(self, rhs: Self) -> RegSet { RegSet(self.0 & !rhs.0) }
}

impl Not for RegSet {
    type Output = RegSet;
    fn not(self) -> RegSet { RegSet(!self.0) }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
