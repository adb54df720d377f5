use std::fmt::Display;

use crate::mem_soc::packet::Address;

/// Half open address range `[start, end)` served by a memory device or reachable behind a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrRange {
    start: Address,
    end: Address,
}

impl AddrRange {
    pub fn new(start: Address, end: Address) -> Self {
        assert!(end > start, "address range must not be empty");
        Self { start, end }
    }

    pub fn with_size(start: Address, size: u64) -> Self {
        Self::new(start, start + size)
    }

    #[inline]
    pub fn start(&self) -> Address {
        self.start
    }

    #[inline]
    pub fn end(&self) -> Address {
        self.end
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.end
    }

    /// true if all `len` bytes starting at `address` fall inside this range
    pub fn contains_span(&self, address: Address, len: usize) -> bool {
        if len == 0 {
            return self.contains(address);
        }
        match address.checked_add(len as Address) {
            Some(last) => address >= self.start && last <= self.end,
            None => false,
        }
    }

    pub fn overlaps(&self, other: &AddrRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl Display for AddrRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}:{:#x})", self.start, self.end)
    }
}

/// checks a span against a list of ranges, the whole span has to live in one of them
pub fn ranges_contain(ranges: &[AddrRange], address: Address, len: usize) -> bool {
    ranges.iter().any(|r| r.contains_span(address, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_span() {
        let range = AddrRange::with_size(0x100, 0x40);
        assert!(range.contains(0x100));
        assert!(!range.contains(0x140));
        assert!(range.contains_span(0x13C, 4));
        assert!(!range.contains_span(0x13E, 4));
        assert!(!range.contains_span(Address::MAX - 1, 4));
    }

    #[test]
    fn test_overlaps() {
        let a = AddrRange::new(0x0, 0x1000);
        let b = AddrRange::new(0x1000, 0x2000);
        let c = AddrRange::new(0xFFF, 0x1001);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert!(ranges_contain(&[a, b], 0x1800, 8));
        assert!(!ranges_contain(&[a, b], 0xFFC, 8));
    }
}
