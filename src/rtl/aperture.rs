use crate::rtl::DeviceAddr;
use crate::utils::align_up;
use std::collections::BTreeMap;

/// Trait for device address range allocation strategies.
pub trait ApertureAllocator {
    /// Reserve a virtual address range within this aperture.
    fn allocate_va(&mut self, size: usize, align: usize) -> Option<DeviceAddr>;

    /// Free a previously reserved virtual address range. Returns the size that was tracked.
    fn free_va(&mut self, addr: DeviceAddr) -> Option<usize>;

    /// Get the aperture's base and limit.
    fn bounds(&self) -> (DeviceAddr, DeviceAddr);
}

/// A managed range of device virtual address space.
#[derive(Debug)]
pub struct Aperture {
    base: DeviceAddr,
    limit: DeviceAddr,
    align: usize,
    /// Live reservations, start -> size.
    allocations: BTreeMap<DeviceAddr, usize>,
}

impl Aperture {
    #[must_use]
    pub fn new(base: DeviceAddr, limit: DeviceAddr, align: usize) -> Self {
        Self {
            base,
            limit,
            align,
            allocations: BTreeMap::new(),
        }
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn used(&self) -> usize {
        self.allocations.values().sum()
    }

    #[must_use]
    pub fn contains(&self, addr: DeviceAddr) -> bool {
        addr >= self.base && addr < self.limit
    }

    /// The tracked allocation containing `addr`, as `(start, size)`.
    #[must_use]
    pub fn find(&self, addr: DeviceAddr) -> Option<(DeviceAddr, usize)> {
        let (&start, &size) = self.allocations.range(..=addr).next_back()?;
        (addr < start + size).then_some((start, size))
    }
}

impl ApertureAllocator for Aperture {
    fn bounds(&self) -> (DeviceAddr, DeviceAddr) {
        (self.base, self.limit)
    }

    fn allocate_va(&mut self, size: usize, align: usize) -> Option<DeviceAddr> {
        let size = size.max(1);
        let align = std::cmp::max(align, self.align);

        let mut candidate_start = align_up(self.base, align);

        // Walk existing allocations looking for a hole
        for (&alloc_start, &alloc_size) in &self.allocations {
            if alloc_start > candidate_start && alloc_start - candidate_start >= size {
                self.allocations.insert(candidate_start, size);
                return Some(candidate_start);
            }
            candidate_start = align_up(alloc_start + alloc_size, align);
        }

        // Space after the last allocation (or the map is empty)
        if candidate_start.checked_add(size)? <= self.limit {
            self.allocations.insert(candidate_start, size);
            return Some(candidate_start);
        }

        None
    }

    fn free_va(&mut self, addr: DeviceAddr) -> Option<usize> {
        let size = self.allocations.remove(&addr);
        if size.is_none() {
            log::error!("Aperture: tried to free {addr:#x} which was not tracked");
        }
        size
    }
}
