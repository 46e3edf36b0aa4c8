//! Address-space layout of the engine-owned ("device-shadow") window.
//!
//! The window is a run of `slices` consecutive, slice-aligned ranges of the host address
//! space, each `1 << slice_bits` bytes long. Every execution context owns one slice. An address
//! is engine-owned exactly when its high bits (everything above `slice_bits`) select one of
//! the window's slices; [`AddressLayout::is_device_shadow`] is the only place that test is made.

use crate::error::{OffloadError, OffloadResult};
use bitflags::bitflags;
use std::fs;

/// Highest canonical user-space address on x86-64 / aarch64 Linux with 4-level paging.
pub const USER_SPACE_LIMIT: usize = 0x0000_7fff_ffff_ffff;

/// Default slice width: 1 TiB per execution context.
pub const DEFAULT_SLICE_BITS: u32 = 40;

const PROC_SELF_MAPS: &str = "/proc/self/maps";

bitflags! {
    /// Permission column of a `/proc/<pid>/maps` line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapPerms: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
        const SHARED = 8;
        const PRIVATE = 16;
    }
}

/// One mapping of the process, as listed by `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapsRange {
    pub start: usize,
    pub end: usize,
    pub perms: MapPerms,
    pub offset: u64,
    pub inode: u64,
    pub name: String,
}

/// Parse the contents of a `/proc/<pid>/maps` file. Malformed lines are skipped.
#[must_use]
pub fn parse_maps(content: &str) -> Vec<MapsRange> {
    content.lines().filter_map(parse_maps_line).collect()
}

fn parse_maps_line(line: &str) -> Option<MapsRange> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms_txt = fields.next()?;
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _device = fields.next()?;
    let inode = fields.next()?.parse().ok()?;
    let name = fields.collect::<Vec<_>>().join(" ");

    let mut perms = MapPerms::empty();
    for (ch, flag) in [
        ('r', MapPerms::READ),
        ('w', MapPerms::WRITE),
        ('x', MapPerms::EXEC),
        ('s', MapPerms::SHARED),
        ('p', MapPerms::PRIVATE),
    ] {
        if perms_txt.contains(ch) {
            perms |= flag;
        }
    }

    Some(MapsRange {
        start: usize::from_str_radix(start, 16).ok()?,
        end: usize::from_str_radix(end, 16).ok()?,
        perms,
        offset,
        inode,
        name,
    })
}

/// Find the highest run of `slices` free, slice-aligned ranges below the top quarter of the
/// user address space. `skip` lists window bases already known to be unusable.
#[must_use]
pub fn find_hole(
    ranges: &[MapsRange],
    slice_bits: u32,
    slices: usize,
    skip: &[usize],
) -> Option<usize> {
    let index_ub = USER_SPACE_LIMIT >> slice_bits;
    let first = index_ub.checked_sub(index_ub.div_ceil(4))?;
    let slices = slices.max(1);

    // Slice 0 holds the null page and the executable; never hand it out.
    (1..=first).rev().find_map(|idx| {
        if idx + slices > index_ub {
            return None;
        }
        let begin = idx << slice_bits;
        let end = (idx + slices) << slice_bits;
        let overlaps = ranges.iter().any(|r| r.start < end && r.end > begin);
        (!overlaps && !skip.contains(&begin)).then_some(begin)
    })
}

/// The engine-owned address window and its per-context partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLayout {
    base: usize,
    slice_bits: u32,
    slices: usize,
}

impl AddressLayout {
    /// # Panics
    /// Panics if `base` is not aligned to the slice width.
    #[must_use]
    pub const fn new(base: usize, slice_bits: u32, slices: usize) -> Self {
        assert!(base & ((1 << slice_bits) - 1) == 0, "window base must be slice aligned");
        Self {
            base,
            slice_bits,
            slices,
        }
    }

    /// Probe the current process for a free window, skipping the given candidate bases.
    ///
    /// # Errors
    /// Returns an error if `/proc/self/maps` cannot be read or no hole is large enough.
    pub fn probe(slice_bits: u32, slices: usize, skip: &[usize]) -> OffloadResult<Self> {
        let content = fs::read_to_string(PROC_SELF_MAPS)?;
        let ranges = parse_maps(&content);
        let base = find_hole(&ranges, slice_bits, slices, skip)
            .ok_or(OffloadError::AddressSpaceExhausted)?;
        log::debug!(
            "Shadow window at {base:#x}: {slices} slice(s) of {:#x} bytes",
            1usize << slice_bits
        );
        Ok(Self::new(base, slice_bits, slices))
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub const fn slice_bits(&self) -> u32 {
        self.slice_bits
    }

    #[must_use]
    pub const fn slices(&self) -> usize {
        self.slices
    }

    #[must_use]
    pub const fn slice_size(&self) -> usize {
        1 << self.slice_bits
    }

    /// Total bytes covered by the window.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.slices << self.slice_bits
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.slices == 0
    }

    /// Mask selecting the tag bits of an address.
    #[must_use]
    pub const fn header_mask(&self) -> usize {
        !(self.slice_size() - 1)
    }

    /// Mask selecting the in-slice offset bits of an address.
    #[must_use]
    pub const fn offset_mask(&self) -> usize {
        self.slice_size() - 1
    }

    /// Whether `addr` belongs to the engine-owned window.
    #[must_use]
    pub const fn is_device_shadow(&self, addr: usize) -> bool {
        let tag = addr & self.header_mask();
        tag >= self.base && tag - self.base < self.len()
    }

    /// Index of the slice containing `addr`.
    #[must_use]
    pub const fn slice_index(&self, addr: usize) -> Option<usize> {
        if self.is_device_shadow(addr) {
            Some(((addr & self.header_mask()) - self.base) >> self.slice_bits)
        } else {
            None
        }
    }

    /// First address of slice `idx`.
    #[must_use]
    pub const fn slice_base(&self, idx: usize) -> Option<usize> {
        if idx < self.slices {
            Some(self.base + (idx << self.slice_bits))
        } else {
            None
        }
    }

    /// Shadow address of `device` inside slice `idx`: the slice tag with the device's offset bits.
    #[must_use]
    pub const fn shadow_of(&self, idx: usize, device: usize) -> Option<usize> {
        match self.slice_base(idx) {
            Some(base) => Some(base | (device & self.offset_mask())),
            None => None,
        }
    }
}
