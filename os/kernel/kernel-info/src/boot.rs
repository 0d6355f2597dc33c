//! # Boot Hand-off
//!
//! The boot loader describes physical memory as a flat list of 24-byte
//! records in the classic `E820` layout:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 8 | base address |
//! | 8 | 8 | length in bytes |
//! | 16 | 4 | type (`1` = usable, anything else reserved) |
//! | 20 | 4 | extended attributes (ignored) |
//!
//! The list may be unsorted and its extents may overlap. Consumers must
//! clip and deduplicate; see the physical frame allocator.

use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// Size of one raw memory map record in bytes.
pub const MEMORY_MAP_ENTRY_SIZE: usize = 24;

/// Record type value the boot loader uses for usable RAM.
pub const MEMORY_KIND_USABLE: u32 = 1;

/// One extent of the physical memory map.
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
    pub attributes: u32,
}

const _: () = assert!(size_of::<MemoryMapEntry>() == MEMORY_MAP_ENTRY_SIZE);

impl MemoryMapEntry {
    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: MEMORY_KIND_USABLE,
            attributes: 0,
        }
    }

    #[must_use]
    pub const fn reserved(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: 2,
            attributes: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.kind == MEMORY_KIND_USABLE
    }

    /// End of the extent (exclusive), saturating at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    fn decode(raw: &[u8]) -> Self {
        let mut qword = [0u8; 8];
        let mut dword = [0u8; 4];

        qword.copy_from_slice(&raw[0..8]);
        let base = u64::from_le_bytes(qword);
        qword.copy_from_slice(&raw[8..16]);
        let length = u64::from_le_bytes(qword);
        dword.copy_from_slice(&raw[16..20]);
        let kind = u32::from_le_bytes(dword);
        dword.copy_from_slice(&raw[20..24]);
        let attributes = u32::from_le_bytes(dword);

        Self {
            base,
            length,
            kind,
            attributes,
        }
    }
}

impl fmt::Debug for MemoryMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryMapEntry(0x{:016X}..0x{:016X}, kind={})",
            self.base,
            self.end(),
            self.kind
        )
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryMapError {
    #[error("memory map of {0} bytes is not a whole number of {MEMORY_MAP_ENTRY_SIZE}-byte records")]
    LengthNotMultipleOfEntry(usize),
}

/// A validated view over the boot loader's raw memory map.
#[derive(Copy, Clone)]
pub struct MemoryMap<'a> {
    raw: &'a [u8],
}

impl<'a> MemoryMap<'a> {
    /// Wrap a raw record buffer.
    ///
    /// # Errors
    /// The buffer length is not a multiple of [`MEMORY_MAP_ENTRY_SIZE`].
    pub const fn from_bytes(raw: &'a [u8]) -> Result<Self, MemoryMapError> {
        if raw.len() % MEMORY_MAP_ENTRY_SIZE != 0 {
            return Err(MemoryMapError::LengthNotMultipleOfEntry(raw.len()));
        }
        Ok(Self { raw })
    }

    /// View already decoded records.
    #[must_use]
    pub const fn from_entries(entries: &'a [MemoryMapEntry]) -> Self {
        // SAFETY: `MemoryMapEntry` is `repr(C)` without padding, so the slice is
        // `entries.len() * 24` initialized bytes that live as long as `entries`.
        let raw = unsafe {
            core::slice::from_raw_parts(
                entries.as_ptr().cast::<u8>(),
                entries.len() * MEMORY_MAP_ENTRY_SIZE,
            )
        };
        Self { raw }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.raw.len() / MEMORY_MAP_ENTRY_SIZE
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<MemoryMapEntry> {
        let start = index.checked_mul(MEMORY_MAP_ENTRY_SIZE)?;
        let record = self.raw.get(start..start + MEMORY_MAP_ENTRY_SIZE)?;
        Some(MemoryMapEntry::decode(record))
    }

    pub fn iter(&self) -> impl Iterator<Item = MemoryMapEntry> + 'a {
        self.raw
            .chunks_exact(MEMORY_MAP_ENTRY_SIZE)
            .map(MemoryMapEntry::decode)
    }

    /// End of the highest usable extent, or zero if there is none.
    #[must_use]
    pub fn highest_usable_end(&self) -> PhysicalAddress {
        let end = self
            .iter()
            .filter(MemoryMapEntry::is_usable)
            .map(|e| e.end())
            .max()
            .unwrap_or(0);
        PhysicalAddress::new(end)
    }
}

impl fmt::Debug for MemoryMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Physical bounds `[start, end)` of the loaded kernel image.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelImage {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

impl KernelImage {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self { start, end }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(entries: &[MemoryMapEntry]) -> Vec<u8> {
        let mut out = Vec::new();
        for e in entries {
            out.extend_from_slice(&e.base.to_le_bytes());
            out.extend_from_slice(&e.length.to_le_bytes());
            out.extend_from_slice(&e.kind.to_le_bytes());
            out.extend_from_slice(&e.attributes.to_le_bytes());
        }
        out
    }

    #[test]
    fn parses_raw_records() {
        let entries = [
            MemoryMapEntry::usable(0x10_0000, 0x70_0000),
            MemoryMapEntry::reserved(0xF000_0000, 0x1000),
        ];
        let raw = encode(&entries);
        let map = MemoryMap::from_bytes(&raw).expect("valid map");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(0), Some(entries[0]));
        assert_eq!(map.get(1).map(|e| e.is_usable()), Some(false));
        assert_eq!(map.get(2), None);
        assert_eq!(map.highest_usable_end(), PhysicalAddress::new(0x80_0000));
    }

    #[test]
    fn rejects_truncated_maps() {
        let mut raw = encode(&[MemoryMapEntry::usable(0, 0x1000)]);
        raw.pop();
        assert_eq!(
            MemoryMap::from_bytes(&raw).err(),
            Some(MemoryMapError::LengthNotMultipleOfEntry(23))
        );
    }

    #[test]
    fn entries_view_matches_bytes() {
        let entries = [
            MemoryMapEntry::usable(0x1000, 0x2000),
            MemoryMapEntry::usable(u64::MAX - 10, 100),
        ];
        let map = MemoryMap::from_entries(&entries);
        let decoded: Vec<_> = map.iter().collect();
        assert_eq!(decoded, entries);
        assert_eq!(decoded[1].end(), u64::MAX);
    }
}
