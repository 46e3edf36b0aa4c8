pub mod allocator;
pub mod context;
pub mod heap;
pub mod layout;
pub mod region;

pub use allocator::{DeviceAllocator, FreeOutcome};
pub use context::MmContext;
pub use layout::{AddressLayout, DEFAULT_SLICE_BITS};

use crate::mm::heap::DEFAULT_HEAP_PAGES;

/// Contexts the shadow window is partitioned into.
pub const DEFAULT_MAX_CONTEXTS: usize = 10;

/// What a context does when its current heap has no fitting block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeapGrowth {
    /// Extend the current heap's mapping, doubling until the request fits.
    InPlace,
    /// Link a fresh heap into the context's list and make it current.
    #[default]
    Relocate,
}

/// How a heap's shadow range relates to its device storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HeapPlacement {
    /// Device storage is allocated first; the shadow range carries the device address's
    /// offset bits inside the context slice.
    Masked,
    /// Shadow ranges are carved from the slice in order; device storage is allocated on first
    /// transfer and translated through the heap.
    #[default]
    Table,
}

/// Tuning of the [`DeviceAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub slice_bits: u32,
    pub max_contexts: usize,
    pub first_heap_pages: usize,
    pub growth: HeapGrowth,
    pub placement: HeapPlacement,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            slice_bits: DEFAULT_SLICE_BITS,
            max_contexts: DEFAULT_MAX_CONTEXTS,
            first_heap_pages: DEFAULT_HEAP_PAGES,
            growth: HeapGrowth::default(),
            placement: HeapPlacement::default(),
        }
    }
}

impl AllocatorConfig {
    /// Resolve combinations that cannot work: masked heaps are pinned to their device block,
    /// so they never grow in place.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.placement == HeapPlacement::Masked && self.growth == HeapGrowth::InPlace {
            log::debug!("Masked heap placement cannot grow in place, relocating instead");
            self.growth = HeapGrowth::Relocate;
        }
        self.first_heap_pages = self.first_heap_pages.max(1);
        self.max_contexts = self.max_contexts.max(1);
        self
    }
}
