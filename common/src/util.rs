use core::fmt;
use std::ops::BitAnd;

/// A contiguous run of bits inside a 64-bit word.
///
/// Used wherever a narrower value lives inside a wider one (sub-register views,
/// partial stores) so the untouched bits can be preserved on insert.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct BitMask64 {
    mask: u64,
    shift: u32,
}

impl BitMask64 {
    #[inline(always)]
    pub fn new<W, S>(width: W, shift: S) -> Self
    where u32: From<W>, u32: From<S> {
        let width = u32::from(width);
        let shift = u32::from(shift);
        debug_assert!(width + shift <= 64, "bit field {width}@{shift} does not fit in 64 bits");
        let mask = if width == 0 {
            0
        } else {
            ((!0u64) >> (64 - width)) << shift
        };
        BitMask64 { mask, shift }
    }

    #[inline(always)]
    pub fn apply(&self, data: u64) -> u64 {
        data & self.mask
    }

    /// Reads the field out of `data`, right-aligned.
    #[inline(always)]
    pub fn extract(&self, data: u64) -> u64 {
        (data & self.mask) >> self.shift
    }

    /// Reads the field out of `data` and sign-extends it from its width.
    #[inline(always)]
    pub fn extract_signed(&self, data: u64) -> u64 {
        let width = self.size();
        if width == 0 {
            return 0;
        }
        let value = self.extract(data);
        let unused = 64 - width;
        (((value << unused) as i64) >> unused) as u64
    }

    /// Writes the low bits of `value` into the field, leaving every other bit of `dest` alone.
    #[inline(always)]
    pub fn masked_insert(&self, dest: &mut u64, value: u64) {
        *dest = (*dest & !self.mask) | (value.wrapping_shl(self.shift) & self.mask);
    }

    #[inline(always)]
    pub fn value(&self) -> u64 {
        self.mask
    }

    pub fn size(&self) -> u32 {
        self.mask.count_ones()
    }
}

impl BitAnd for BitMask64 {
    type Output = Self;

    #[inline(always)]
    fn bitand(self, rhs: Self) -> Self::Output {
        let mask = self.mask & rhs.mask;
        BitMask64 {
            mask,
            shift: if mask == 0 { 0 } else { mask.trailing_zeros() },
        }
    }
}

impl Default for BitMask64 {
    #[inline(always)]
    fn default() -> Self {
        BitMask64 { mask: !0, shift: 0 }
    }
}

impl fmt::Debug for BitMask64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitMask64({:016x})", self.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_preserves_other_bits() {
        let mid = BitMask64::new(16u8, 16u8);
        let mut word = 0x1111_2222_3333_4444u64;
        mid.masked_insert(&mut word, 0xabcd);
        assert_eq!(word, 0x1111_2222_abcd_4444);
        assert_eq!(mid.extract(word), 0xabcd);
        assert_eq!(mid.size(), 16);
    }

    #[test]
    fn signed_extract() {
        let low = BitMask64::new(16u8, 0u8);
        assert_eq!(low.extract_signed(0x8000), 0xffff_ffff_ffff_8000);
        assert_eq!(low.extract_signed(0x7fff), 0x7fff);
    }

    #[test]
    fn full_width() {
        let full = BitMask64::new(64u8, 0u8);
        assert_eq!(full, BitMask64::default());
        let mut word = 5;
        full.masked_insert(&mut word, u64::MAX);
        assert_eq!(word, u64::MAX);
    }

    #[test]
    fn intersection() {
        let a = BitMask64::new(32u8, 0u8);
        let b = BitMask64::new(32u8, 16u8);
        let both = a & b;
        assert_eq!(both.value(), 0xffff_0000);
        assert_eq!(both.extract(0x1234_5678), 0x1234);
    }
}
