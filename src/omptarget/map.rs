use crate::error::{OffloadError, OffloadResult};
use crate::rtl::{DeviceAddr, HostAddr};
use std::collections::BTreeMap;
use std::fmt;

/// Reference count of a mapping.
///
/// Counts at or above [`RefCount::INFINITE`] mark user associations: they are never read as
/// decrementing and only a forced delete removes them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefCount(i64);

impl RefCount {
    pub const INFINITE: Self = Self(i64::MAX >> 1);
    pub const ONE: Self = Self(1);

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn is_infinite(self) -> bool {
        self.0 >= Self::INFINITE.0
    }

    fn increment(&mut self) {
        if !self.is_infinite() {
            self.0 += 1;
        }
    }

    fn decrement(&mut self) {
        if !self.is_infinite() {
            self.0 -= 1;
        }
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            f.write_str("INF")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// One mirrored host range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingEntry {
    pub host_base: HostAddr,
    pub host_begin: HostAddr,
    pub host_end: HostAddr,
    pub device_begin: DeviceAddr,
    pub ref_count: RefCount,
}

impl MappingEntry {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.host_end - self.host_begin
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.host_end == self.host_begin
    }

    #[must_use]
    pub const fn contains(&self, addr: HostAddr) -> bool {
        addr >= self.host_begin && addr < self.host_end
    }

    /// Device address mirroring `addr`. Addresses below the entry (an implicit extension
    /// before it) translate with wrapping arithmetic, like the pointer math they stand for.
    #[must_use]
    pub const fn translate(&self, addr: HostAddr) -> DeviceAddr {
        self.device_begin
            .wrapping_add(addr.wrapping_sub(self.host_begin))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupFlags {
    pub is_contained: bool,
    pub extends_before: bool,
    pub extends_after: bool,
}

impl LookupFlags {
    fn of(entry: &MappingEntry, begin: HostAddr, size: usize) -> Self {
        let Some(end) = begin.checked_add(size) else {
            return Self::default();
        };
        Self {
            is_contained: begin >= entry.host_begin
                && begin < entry.host_end
                && end <= entry.host_end,
            extends_before: begin < entry.host_begin && end > entry.host_begin,
            extends_after: begin < entry.host_end && end > entry.host_end,
        }
    }

    #[must_use]
    pub const fn any(self) -> bool {
        self.is_contained || self.extends_before || self.extends_after
    }

    #[must_use]
    pub const fn extends(self) -> bool {
        self.extends_before || self.extends_after
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LookupResult<'a> {
    pub entry: Option<&'a MappingEntry>,
    pub flags: LookupFlags,
}

/// Result of [`AddressMap::get_or_allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPointer {
    pub device: DeviceAddr,
    pub is_new: bool,
}

/// Result of [`AddressMap::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseResult {
    pub device: Option<DeviceAddr>,
    pub is_last: bool,
}

/// Host ranges mirrored on one device, keyed by host begin.
///
/// Entries never overlap. The map does no locking of its own; the owning device serializes
/// every lookup-then-mutate sequence under one lock.
#[derive(Debug, Default)]
pub struct AddressMap {
    entries: BTreeMap<HostAddr, MappingEntry>,
}

impl AddressMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn get(&self, begin: HostAddr) -> Option<&MappingEntry> {
        self.entries.get(&begin)
    }

    /// Only the nearest entry strictly below `begin` and the first entry at or above it are
    /// inspected, so with several overlapped entries just one is reported. Overlap itself is
    /// always detected because entries never overlap each other. A range wrapping past the top
    /// of the address space matches nothing.
    fn lookup_key(&self, begin: HostAddr, size: usize) -> (Option<HostAddr>, LookupFlags) {
        if begin.checked_add(size).is_none() {
            return (None, LookupFlags::default());
        }
        let below = self.entries.range(..begin).next_back();
        let above = self.entries.range(begin..).next();

        let mut result = (None, LookupFlags::default());
        for (&key, entry) in below.into_iter().chain(above) {
            let flags = LookupFlags::of(entry, begin, size);
            result = (Some(key), flags);
            if flags.any() {
                break;
            }
        }

        let flags = result.1;
        if flags.extends_before {
            log::warn!(
                "Pointer {begin:#x} is not mapped but section extends into already mapped data"
            );
        }
        if flags.extends_after {
            log::warn!(
                "Pointer {begin:#x} is already mapped but section extends beyond mapped region"
            );
        }
        if flags.any() { result } else { (None, flags) }
    }

    /// Find the mapping overlapping `[begin, begin + size)`.
    #[must_use]
    pub fn lookup(&self, begin: HostAddr, size: usize) -> LookupResult<'_> {
        let (key, flags) = self.lookup_key(begin, size);
        LookupResult {
            entry: key.and_then(|k| self.entries.get(&k)),
            flags,
        }
    }

    /// Return the device address for a host range, allocating through `alloc` on first use.
    ///
    /// A range inside an existing entry, or overlapping one when `implicit`, reuses it. A
    /// zero-sized range that is not mapped yields `Ok(None)`.
    ///
    /// # Errors
    /// Returns `AddressOverflow` for a range wrapping past the top of the address space,
    /// `ExplicitExtension` when an explicit map overlaps an entry without being contained in
    /// it, and propagates allocation failures. The map is unchanged on error.
    pub fn get_or_allocate(
        &mut self,
        begin: HostAddr,
        base: HostAddr,
        size: usize,
        implicit: bool,
        update_ref: bool,
        alloc: impl FnOnce(HostAddr, usize) -> OffloadResult<DeviceAddr>,
    ) -> OffloadResult<Option<TargetPointer>> {
        let end = begin
            .checked_add(size)
            .ok_or(OffloadError::AddressOverflow { begin, size })?;
        let (key, flags) = self.lookup_key(begin, size);

        if let Some(key) = key
            && (flags.is_contained || (flags.extends() && implicit))
            && let Some(entry) = self.entries.get_mut(&key)
        {
            if update_ref {
                entry.ref_count.increment();
            }
            let device = entry.translate(begin);
            log::debug!(
                "Mapping exists{} with begin={begin:#x}, device={device:#x}, size={size}, RefCount={:?}",
                if implicit { " (implicit)" } else { "" },
                entry.ref_count
            );
            return Ok(Some(TargetPointer {
                device,
                is_new: false,
            }));
        }

        if flags.extends() {
            log::debug!("Explicit extension of mapping at {begin:#x} is not allowed");
            return Err(OffloadError::ExplicitExtension(begin));
        }
        if size == 0 {
            return Ok(None);
        }

        let device = alloc(begin, size)?;
        log::debug!(
            "Creating new map entry: base={base:#x}, begin={begin:#x}, end={end:#x}, device={device:#x}"
        );
        self.entries.insert(
            begin,
            MappingEntry {
                host_base: base,
                host_begin: begin,
                host_end: end,
                device_begin: device,
                ref_count: RefCount::ONE,
            },
        );
        Ok(Some(TargetPointer {
            device,
            is_new: true,
        }))
    }

    /// Look up a mapped range, dropping one reference when `update_ref` is set and the entry
    /// is still shared. `is_last` reflects the count before any decrement.
    pub fn release(&mut self, begin: HostAddr, size: usize, update_ref: bool) -> ReleaseResult {
        let (key, _) = self.lookup_key(begin, size);
        let Some(entry) = key.and_then(|k| self.entries.get_mut(&k)) else {
            return ReleaseResult {
                device: None,
                is_last: false,
            };
        };

        let is_last = entry.ref_count <= RefCount::ONE;
        if !is_last && update_ref {
            entry.ref_count.decrement();
        }
        let device = entry.translate(begin);
        log::debug!(
            "Mapping exists with begin={begin:#x}, device={device:#x}, size={size}, RefCount={:?}",
            entry.ref_count
        );
        ReleaseResult {
            device: Some(device),
            is_last,
        }
    }

    /// Drop one reference (or all, with `force`). When none remain the entry is removed and
    /// handed to `free`. Returns whether the entry was removed.
    ///
    /// # Errors
    /// Returns `NotMapped` when no entry overlaps the range. Errors from `free` are returned
    /// after the entry is already gone.
    pub fn deallocate(
        &mut self,
        begin: HostAddr,
        size: usize,
        force: bool,
        free: impl FnOnce(&MappingEntry) -> OffloadResult<()>,
    ) -> OffloadResult<bool> {
        let (key, _) = self.lookup_key(begin, size);
        let Some((key, entry)) = key.and_then(|k| self.entries.get_mut(&k).map(|e| (k, e)))
        else {
            log::debug!("Section to delete ({begin:#x}) does not exist in the mapped memory");
            return Err(OffloadError::NotMapped(begin));
        };

        if force {
            entry.ref_count = RefCount::ONE;
        }
        entry.ref_count.decrement();
        if entry.ref_count.get() > 0 {
            return Ok(false);
        }

        let entry = self
            .entries
            .remove(&key)
            .ok_or(OffloadError::NotMapped(begin))?;
        log::debug!(
            "Removing{} mapping with begin={:#x}, device={:#x}, size={size}",
            if force { " (forced)" } else { "" },
            entry.host_begin,
            entry.device_begin
        );
        free(&entry)?;
        Ok(true)
    }

    /// Record a user-provided device range for `begin`. Idempotent for an identical entry.
    ///
    /// # Errors
    /// Returns `AssociationConflict` if an entry already starts at `begin` with different
    /// bounds or target, and `AddressOverflow` for a range wrapping the address space.
    pub fn associate(
        &mut self,
        begin: HostAddr,
        device: DeviceAddr,
        size: usize,
    ) -> OffloadResult<()> {
        let end = begin
            .checked_add(size)
            .ok_or(OffloadError::AddressOverflow { begin, size })?;
        if let Some(entry) = self.entries.get(&begin) {
            if entry.host_end == end && entry.device_begin == device {
                log::debug!("Association {begin:#x} -> {device:#x} already exists");
                return Ok(());
            }
            log::debug!("Host pointer {begin:#x} already has a different mapping");
            return Err(OffloadError::AssociationConflict(begin));
        }

        log::debug!("Creating new association: begin={begin:#x}, end={end:#x}, device={device:#x}");
        self.entries.insert(
            begin,
            MappingEntry {
                host_base: begin,
                host_begin: begin,
                host_end: end,
                device_begin: device,
                ref_count: RefCount::INFINITE,
            },
        );
        Ok(())
    }

    /// Remove an association made by [`AddressMap::associate`].
    ///
    /// # Errors
    /// Returns `NotAssociated` unless an associated entry starts exactly at `begin`.
    pub fn disassociate(&mut self, begin: HostAddr) -> OffloadResult<MappingEntry> {
        match self.entries.get(&begin) {
            Some(entry) if entry.ref_count.is_infinite() => {
                log::debug!("Association found, removing it");
                self.entries
                    .remove(&begin)
                    .ok_or(OffloadError::NotAssociated(begin))
            }
            Some(_) => {
                log::debug!("Pointer {begin:#x} was mapped, not associated");
                Err(OffloadError::NotAssociated(begin))
            }
            None => Err(OffloadError::NotAssociated(begin)),
        }
    }

    /// Reference count of the entry containing `addr`.
    #[must_use]
    pub fn ref_count(&self, addr: HostAddr) -> Option<RefCount> {
        self.entries
            .range(..=addr)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.contains(addr))
            .map(|e| e.ref_count)
    }

    pub fn dump(&self) {
        log::debug!("Address map: {} entries", self.entries.len());
        for e in self.entries.values() {
            log::debug!(
                "\thost [{:#x}, {:#x}) base {:#x} -> device {:#x}, RefCount {:?}",
                e.host_begin,
                e.host_end,
                e.host_base,
                e.device_begin,
                e.ref_count
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::Cell;

    fn bump(next: &Cell<usize>) -> impl FnOnce(HostAddr, usize) -> OffloadResult<DeviceAddr> + '_ {
        move |_, size| {
            let addr = next.get();
            next.set(addr + size.next_multiple_of(0x1000));
            Ok(addr)
        }
    }

    #[test]
    fn map_release_delete_cycle() {
        let mut map = AddressMap::new();
        let next = Cell::new(0x10_0000);

        let first = map
            .get_or_allocate(0x1000, 0x1000, 0x100, false, true, bump(&next))
            .unwrap()
            .unwrap();
        assert!(first.is_new);
        assert_eq!(map.len(), 1);
        assert_eq!(map.ref_count(0x1000), Some(RefCount::ONE));

        let second = map
            .get_or_allocate(0x1000, 0x1000, 0x100, false, true, bump(&next))
            .unwrap()
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(second.device, first.device);
        assert_eq!(map.ref_count(0x1000).map(RefCount::get), Some(2));

        let r = map.release(0x1000, 0x100, true);
        assert_eq!(r, ReleaseResult { device: Some(first.device), is_last: false });
        assert_eq!(map.ref_count(0x1000).map(RefCount::get), Some(1));

        let r = map.release(0x1000, 0x100, true);
        assert!(r.is_last);

        let mut freed = None;
        let removed = map
            .deallocate(0x1000, 0x100, false, |e| {
                freed = Some(e.device_begin);
                Ok(())
            })
            .unwrap();
        assert!(removed);
        assert_eq!(freed, Some(first.device));
        assert!(map.is_empty());
    }

    #[test]
    fn interior_ranges_translate() {
        let mut map = AddressMap::new();
        let next = Cell::new(0x10_0000);
        map.get_or_allocate(0x1000, 0x1000, 0x100, false, true, bump(&next))
            .unwrap();

        let inner = map
            .get_or_allocate(0x1010, 0x1000, 0x10, false, false, bump(&next))
            .unwrap()
            .unwrap();
        assert_eq!(inner.device, 0x10_0010);
        assert_eq!(map.ref_count(0x10ff).map(RefCount::get), Some(1));
        assert_eq!(map.ref_count(0x1100), None);
    }

    #[test]
    fn explicit_extension_is_rejected() {
        let mut map = AddressMap::new();
        let next = Cell::new(0x10_0000);
        map.get_or_allocate(0x1000, 0x1000, 0x100, false, true, bump(&next))
            .unwrap();

        let mut called = false;
        let err = map.get_or_allocate(0x1080, 0x1080, 0x100, false, true, |_, _| {
            called = true;
            Ok(0)
        });
        assert!(matches!(err, Err(OffloadError::ExplicitExtension(0x1080))));
        assert!(!called);

        let before = map.lookup(0xf80, 0x100);
        assert!(before.flags.extends_before);
        assert_eq!(before.entry.map(|e| e.host_begin), Some(0x1000));

        // Implicit maps reuse the overlapped entry.
        let tp = map
            .get_or_allocate(0x1080, 0x1080, 0x100, true, true, bump(&next))
            .unwrap()
            .unwrap();
        assert_eq!(tp.device, 0x10_0080);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn zero_size_maps_nothing() {
        let mut map = AddressMap::new();
        let next = Cell::new(0x10_0000);
        assert_eq!(
            map.get_or_allocate(0x1000, 0x1000, 0, false, true, bump(&next))
                .unwrap(),
            None
        );
        assert!(map.is_empty());
    }

    #[test]
    fn allocation_failure_leaves_map_untouched() {
        let mut map = AddressMap::new();
        let res = map.get_or_allocate(0x1000, 0x1000, 0x10, false, true, |_, size| {
            Err(OffloadError::OutOfMemory(size))
        });
        assert!(matches!(res, Err(OffloadError::OutOfMemory(0x10))));
        assert!(map.is_empty());
    }

    #[test]
    fn associations_are_infinite() {
        let mut map = AddressMap::new();
        map.associate(0x2000, 0x9000, 0x40).unwrap();
        map.associate(0x2000, 0x9000, 0x40).unwrap();
        assert!(matches!(
            map.associate(0x2000, 0xa000, 0x40),
            Err(OffloadError::AssociationConflict(0x2000))
        ));

        let before = map.ref_count(0x2000).unwrap();
        assert!(before.is_infinite());
        map.get_or_allocate(0x2000, 0x2000, 0x40, false, true, |_, _| Ok(0))
            .unwrap();
        let r = map.release(0x2000, 0x40, true);
        assert!(!r.is_last);
        assert_eq!(map.ref_count(0x2000), Some(before));

        // A plain delete never removes it, a forced one does.
        assert!(!map.deallocate(0x2000, 0x40, false, |_| Ok(())).unwrap());
        assert_eq!(map.len(), 1);

        map.disassociate(0x2000).unwrap();
        assert!(matches!(
            map.disassociate(0x2000),
            Err(OffloadError::NotAssociated(0x2000))
        ));
    }

    #[test]
    fn disassociate_requires_an_association() {
        let mut map = AddressMap::new();
        map.get_or_allocate(0x3000, 0x3000, 0x10, false, true, |_, _| Ok(0x5000))
            .unwrap();
        assert!(matches!(
            map.disassociate(0x3000),
            Err(OffloadError::NotAssociated(0x3000))
        ));
        assert!(map.deallocate(0x3000, 0x10, true, |_| Ok(())).unwrap());
    }

    #[test]
    fn ranges_wrapping_the_address_space_are_rejected() {
        let mut map = AddressMap::new();
        let top = usize::MAX - 0x100;
        map.get_or_allocate(top, top, 0x80, false, true, |_, _| Ok(0x7000))
            .unwrap()
            .unwrap();

        let wrap = usize::MAX - 0x10;
        let res = map.get_or_allocate(wrap, wrap, 0x20, false, true, |_, _| {
            panic!("no storage for a wrapping range")
        });
        assert!(matches!(
            res,
            Err(OffloadError::AddressOverflow { begin, size: 0x20 }) if begin == wrap
        ));
        assert!(map.lookup(top, usize::MAX).entry.is_none());
        assert!(!map.lookup(wrap, 0x20).flags.any());
        assert!(matches!(
            map.associate(wrap, 0x9000, 0x20),
            Err(OffloadError::AddressOverflow { .. })
        ));
        assert_eq!(map.len(), 1);
        assert!(map.lookup(top, 0x80).entry.is_some());
    }

    #[test]
    fn deallocate_of_unmapped_range_fails() {
        let mut map = AddressMap::new();
        assert!(matches!(
            map.deallocate(0x1000, 8, false, |_| Ok(())),
            Err(OffloadError::NotMapped(0x1000))
        ));
        assert_eq!(map.release(0x1000, 8, true), ReleaseResult { device: None, is_last: false });
    }

    proptest! {
        #[test]
        fn entries_never_overlap(
            ops in prop::collection::vec((0usize..64, 1usize..8, any::<bool>(), any::<bool>()), 1..60)
        ) {
            let mut map = AddressMap::new();
            let next = Cell::new(0x100_0000);
            for (slot, len, implicit, release) in ops {
                let begin = slot * 0x10;
                let size = len * 0x10;
                if release {
                    let _ = map.deallocate(begin, size, false, |_| Ok(()));
                } else {
                    let _ = map.get_or_allocate(begin, begin, size, implicit, true, bump(&next));
                }
                let entries: Vec<&MappingEntry> = map.iter().collect();
                for pair in entries.windows(2) {
                    prop_assert!(pair[0].host_end <= pair[1].host_begin);
                }
            }
        }

        #[test]
        fn release_then_map_is_stable(extra in 1usize..5) {
            let mut map = AddressMap::new();
            let next = Cell::new(0x100_0000);
            let first = map.get_or_allocate(0x1000, 0x1000, 0x80, false, true, bump(&next)).unwrap().unwrap();
            for _ in 0..extra {
                map.get_or_allocate(0x1000, 0x1000, 0x80, false, true, bump(&next)).unwrap();
            }
            map.release(0x1000, 0x80, true);
            let again = map.get_or_allocate(0x1000, 0x1000, 0x80, false, true, bump(&next)).unwrap().unwrap();
            prop_assert_eq!(again.device, first.device);
            prop_assert!(!again.is_new);
        }
    }
}
