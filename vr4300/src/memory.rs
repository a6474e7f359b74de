use std::ops::Range;

use anyhow::bail;
use log::trace;

use dynarec::block_cache::GRANULE_SHIFT;
use dynarec::{GuestMemory, InvalidationHandle, MemoryFault};

/// Flat big-endian RAM mapped at `base`. Unaligned and unmapped accesses fault.
///
/// Instruction fetches mark their granule; a store into a marked granule posts an
/// invalidation so stale compiled code is dropped at the next block boundary.
pub struct Ram {
    base: u32,
    data: Vec<u8>,
    fetched: Vec<bool>,
    invalidations: Option<InvalidationHandle>,
}

impl Ram {
    pub fn new(base: u32, size: usize) -> Ram {
        let granules = size.div_ceil(1 << GRANULE_SHIFT);
        Ram {
            base,
            data: vec![0; size],
            fetched: vec![false; granules],
            invalidations: None,
        }
    }

    pub fn with_image(base: u32, size: usize, image: &[u8]) -> anyhow::Result<Ram> {
        if image.len() > size {
            bail!("image of {} bytes does not fit in {size} bytes of RAM", image.len());
        }
        if (base as u64) + (size as u64) >= 1 << 32 {
            bail!("RAM at {base:#010x} runs past the end of the address space");
        }
        let mut ram = Ram::new(base, size);
        ram.data[..image.len()].copy_from_slice(image);
        Ok(ram)
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn watch_code(&mut self, handle: InvalidationHandle) {
        self.invalidations = Some(handle);
    }

    pub fn load_words(&mut self, address: u32, words: &[u32]) -> Result<(), MemoryFault> {
        for (i, &word) in words.iter().enumerate() {
            self.write_u32(address.wrapping_add(4 * i as u32), word)?;
        }
        Ok(())
    }

    /// Reads without marking anything as code
    pub fn read_word(&self, address: u32) -> Result<u32, MemoryFault> {
        let range = self.range(address, 4)?;
        let mut word = [0; 4];
        word.copy_from_slice(&self.data[range]);
        Ok(u32::from_be_bytes(word))
    }

    fn range(&self, address: u32, len: usize) -> Result<Range<usize>, MemoryFault> {
        let offset = address.wrapping_sub(self.base) as usize;
        if address < self.base || address as usize % len != 0 || offset + len > self.data.len() {
            return Err(MemoryFault { address });
        }
        Ok(offset..offset + len)
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), MemoryFault> {
        let range = self.range(address, bytes.len())?;
        let granule = range.start >> GRANULE_SHIFT;
        if self.fetched[granule] {
            self.fetched[granule] = false;
            if let Some(handle) = &self.invalidations {
                trace!("store to code at {address:#010x}");
                let start = self.base + ((granule as u32) << GRANULE_SHIFT);
                handle.invalidate(start..start + (1 << GRANULE_SHIFT));
            }
        }
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }
}

impl GuestMemory for Ram {
    fn read_u8(&mut self, address: u32) -> Result<u8, MemoryFault> {
        let range = self.range(address, 1)?;
        Ok(self.data[range.start])
    }

    fn read_u16(&mut self, address: u32) -> Result<u16, MemoryFault> {
        let range = self.range(address, 2)?;
        Ok(u16::from_be_bytes([self.data[range.start], self.data[range.start + 1]]))
    }

    fn read_u32(&mut self, address: u32) -> Result<u32, MemoryFault> {
        self.read_word(address)
    }

    fn write_u8(&mut self, address: u32, value: u8) -> Result<(), MemoryFault> {
        self.write(address, &[value])
    }

    fn write_u16(&mut self, address: u32, value: u16) -> Result<(), MemoryFault> {
        self.write(address, &value.to_be_bytes())
    }

    fn write_u32(&mut self, address: u32, value: u32) -> Result<(), MemoryFault> {
        self.write(address, &value.to_be_bytes())
    }

    fn read_code(&mut self, address: u32) -> Result<u32, MemoryFault> {
        let word = self.read_word(address)?;
        self.fetched[(address - self.base) as usize >> GRANULE_SHIFT] = true;
        Ok(word)
    }
}
