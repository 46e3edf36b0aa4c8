//! Bulk-mode segments: mapped ranges merged into coarse transfer units, and the translation
//! table kernels use to resolve host pointers against them.

use crate::error::{OffloadError, OffloadResult};
use crate::omptarget::io::DeviceIo;
use crate::omptarget::map::LookupFlags;
use crate::rtl::{DeviceAddr, HostAddr};
use crate::utils::WORD_SIZE;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::{Excluded, Unbounded};

/// Layout revision of [`TableEntry`] tables, carried in the header row's `host_end`. Device
/// code built against another revision cannot read the table.
pub const TABLE_FORMAT_VERSION: usize = 1;

/// Spare entries allocated whenever the device table buffer has to grow.
const TABLE_SPARE_ENTRIES: usize = 4;

/// A merged host range and, once the transfer is planned, its device storage.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub host_begin: HostAddr,
    pub host_end: HostAddr,
    pub device_begin: Option<DeviceAddr>,
}

impl Segment {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.host_end - self.host_begin
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.host_end == self.host_begin
    }

    #[must_use]
    pub const fn is_backed(&self) -> bool {
        self.device_begin.is_some()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device_begin {
            Some(dev) => write!(
                f,
                "[{:#x}:{:#x}->{dev:#x}<{}>]",
                self.host_begin,
                self.host_end,
                self.len()
            ),
            None => write!(f, "[{:#x}:{:#x}<{}>]", self.host_begin, self.host_end, self.len()),
        }
    }
}

/// One row of the translation table, three machine words as device code reads them.
///
/// Row 0 is a header: its `host_begin` holds the number of rows that follow and its
/// `host_end` the [`TABLE_FORMAT_VERSION`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableEntry {
    pub host_begin: usize,
    pub host_end: usize,
    pub device_begin: usize,
}

impl TableEntry {
    pub const SIZE: usize = 3 * WORD_SIZE;

    /// Serialize rows in native byte order.
    #[must_use]
    pub fn to_bytes(table: &[Self]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(table.len() * Self::SIZE);
        for row in table {
            bytes.extend_from_slice(&row.host_begin.to_ne_bytes());
            bytes.extend_from_slice(&row.host_end.to_ne_bytes());
            bytes.extend_from_slice(&row.device_begin.to_ne_bytes());
        }
        bytes
    }
}

/// Host mirror of the device-side table lookup: binary search over rows `1..=count`. Tables
/// of another format revision resolve nothing.
#[must_use]
pub fn device_lookup(table: &[TableEntry], addr: HostAddr) -> Option<DeviceAddr> {
    let header = table.first()?;
    if header.host_end != TABLE_FORMAT_VERSION {
        return None;
    }
    let count = header.host_begin.min(table.len().saturating_sub(1));
    let (mut lo, mut hi) = (1, count);
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let row = &table[mid];
        if addr < row.host_begin {
            hi = mid - 1;
        } else if addr >= row.host_end {
            lo = mid + 1;
        } else {
            return (row.device_begin != 0).then(|| row.device_begin + (addr - row.host_begin));
        }
    }
    None
}

#[derive(Debug, Clone, Copy)]
pub struct BulkLookup<'a> {
    pub segment: Option<&'a Segment>,
    pub flags: LookupFlags,
}

#[derive(Debug, Clone, Copy)]
struct TableBuffer {
    device: DeviceAddr,
    capacity: usize,
}

/// Segments of one device, keyed by host begin.
#[derive(Debug)]
pub struct SegmentList {
    segments: BTreeMap<HostAddr, Segment>,
    threshold: usize,
    table: Option<TableBuffer>,
}

impl SegmentList {
    /// Ranges closer than `threshold` bytes are merged into one segment.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            segments: BTreeMap::new(),
            threshold: threshold.max(1),
            table: None,
        }
    }

    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    /// Host bytes covered by all segments.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.segments.values().map(Segment::len).sum()
    }

    /// Device address and size in bytes of the last transferred table.
    #[must_use]
    pub fn table_buffer(&self) -> Option<(DeviceAddr, usize)> {
        self.table.map(|t| (t.device, t.capacity))
    }

    /// Record `[begin, begin + size)` for the next transfer, merging it with unbacked
    /// segments closer than the threshold. Backed segments are never extended.
    ///
    /// # Errors
    /// Fails for an empty range, a range wrapping past the top of the address space, and a
    /// range overlapping a backed segment without being contained in it. Nothing changes on
    /// failure.
    pub fn allocate(&mut self, begin: HostAddr, size: usize) -> OffloadResult<()> {
        if size == 0 {
            return Err(OffloadError::General(format!(
                "empty bulk segment at {begin:#x}"
            )));
        }
        let end = begin
            .checked_add(size)
            .ok_or(OffloadError::AddressOverflow { begin, size })?;
        let overlap = |seg: &Segment| OffloadError::Overlap {
            begin,
            end,
            seg_begin: seg.host_begin,
            seg_end: seg.host_end,
        };

        let mut new_begin = begin;
        let mut new_end = end;
        let mut found = false;
        let mut extend_high = false;
        let mut contained_in_old = false;
        let mut absorbed = Vec::new();

        if let Some((&key, cur)) = self.segments.range(..=begin).next_back()
            && begin.saturating_sub(cur.host_end) < self.threshold
        {
            let mut merge = true;
            if new_end > cur.host_end {
                if cur.is_backed() {
                    if begin < cur.host_end {
                        log::debug!("{begin:#x}+{size:#x} overlaps backed segment {cur:?}");
                        return Err(overlap(cur));
                    }
                    merge = false;
                } else {
                    extend_high = true;
                }
            } else {
                new_end = cur.host_end;
                contained_in_old = true;
                if cur.is_backed() {
                    log::debug!("{begin:#x}+{size:#x} contained in {cur:?}");
                    return Ok(());
                }
            }
            if merge {
                new_begin = cur.host_begin;
                found = true;
                absorbed.push(key);
            }
        }

        for (&key, next) in self.segments.range((Excluded(begin), Unbounded)) {
            if found && !extend_high && !contained_in_old {
                break;
            }
            let overlaps = next.host_begin < new_end;
            if !overlaps && next.host_begin - new_end >= self.threshold {
                break;
            }
            if next.is_backed() {
                if overlaps {
                    log::debug!("{begin:#x}+{size:#x} overlaps backed segment {next:?}");
                    return Err(overlap(next));
                }
                break;
            }
            log::debug!("Merged {next:?}");
            if new_end > next.host_end {
                extend_high = true;
            } else {
                new_end = next.host_end;
                extend_high = false;
            }
            found = true;
            absorbed.push(key);
        }

        for key in absorbed {
            self.segments.remove(&key);
        }
        let seg = Segment {
            host_begin: new_begin,
            host_end: new_end,
            device_begin: None,
        };
        if found {
            log::debug!("Added [{begin:#x},{end:#x}) to segment {seg:?}");
        } else {
            log::debug!("New segment [{begin:#x},{end:#x})");
        }
        self.segments.insert(new_begin, seg);
        Ok(())
    }

    /// Classify `[begin, begin + size)` against the segments. A range wrapping past the top
    /// of the address space matches nothing.
    #[must_use]
    pub fn lookup(&self, begin: HostAddr, size: usize) -> BulkLookup<'_> {
        let Some(end) = begin.checked_add(size) else {
            return BulkLookup {
                segment: None,
                flags: LookupFlags::default(),
            };
        };
        if let Some((_, seg)) = self.segments.range(..=begin).next_back()
            && begin < seg.host_end
        {
            let contained = end <= seg.host_end;
            return BulkLookup {
                segment: Some(seg),
                flags: LookupFlags {
                    is_contained: contained,
                    extends_after: !contained,
                    extends_before: false,
                },
            };
        }
        if let Some((_, next)) = self.segments.range((Excluded(begin), Unbounded)).next()
            && end > next.host_begin
        {
            return BulkLookup {
                segment: Some(next),
                flags: LookupFlags {
                    extends_before: true,
                    ..LookupFlags::default()
                },
            };
        }
        BulkLookup {
            segment: None,
            flags: LookupFlags::default(),
        }
    }

    /// Device address of `begin`, if its segment is backed.
    #[must_use]
    pub fn device_address(&self, begin: HostAddr, size: usize) -> Option<DeviceAddr> {
        let r = self.lookup(begin, size);
        let seg = r.segment?;
        if r.flags.extends_before {
            log::error!("{begin:#x}+{size:#x} extends before segment {seg:?}");
            return None;
        }
        if r.flags.extends_after {
            log::error!("{begin:#x}+{size:#x} extends after segment {seg:?}");
        }
        let Some(dev) = seg.device_begin else {
            log::debug!("{begin:#x} is not backed by device memory yet");
            return None;
        };
        Some(dev + (begin - seg.host_begin))
    }

    /// Allocate and fill device storage for every segment not backed yet.
    ///
    /// # Safety
    /// Every segment's host range must be readable.
    ///
    /// # Errors
    /// Propagates allocation and transfer failures; segments planned before the failure stay
    /// backed.
    pub unsafe fn plan_transfer(&mut self, io: &DeviceIo<'_>) -> OffloadResult<()> {
        for seg in self.segments.values_mut().filter(|s| !s.is_backed()) {
            let size = seg.len();
            log::debug!("Alloc and copy segment {seg:?}");
            let dev = io.allocate(size, None)?;
            seg.device_begin = Some(dev);
            // SAFETY: caller guarantees segment host ranges are readable.
            unsafe { io.submit_host(dev, seg.host_begin, size)? };
        }
        if let Some(perf) = io.perf {
            perf.set_target_mem(self.total_bytes());
        }
        log::debug!("Bulk transferred {} segments", self.segments.len());
        Ok(())
    }

    /// Copy a range straight to the device if its segment is already backed. Returns whether
    /// anything was copied; unbacked ranges travel with the next planned transfer.
    ///
    /// # Safety
    /// `[begin, begin + size)` must be readable.
    ///
    /// # Errors
    /// Propagates transfer failures.
    pub unsafe fn submit_if_backed(
        &self,
        io: &DeviceIo<'_>,
        begin: HostAddr,
        size: usize,
    ) -> OffloadResult<bool> {
        let Some(dev) = self.device_address(begin, size) else {
            return Ok(false);
        };
        // SAFETY: forwarded from the caller.
        unsafe { io.submit_host(dev, begin, size)? };
        Ok(true)
    }

    /// Copy a range back from its segment's device storage.
    ///
    /// # Safety
    /// `[begin, begin + size)` must be writable.
    ///
    /// # Errors
    /// Returns `NotMapped` when the range has no backed segment.
    pub unsafe fn retrieve(
        &self,
        io: &DeviceIo<'_>,
        begin: HostAddr,
        size: usize,
    ) -> OffloadResult<()> {
        let dev = self
            .device_address(begin, size)
            .ok_or(OffloadError::NotMapped(begin))?;
        // SAFETY: forwarded from the caller.
        unsafe { io.retrieve_host(begin, dev, size) }
    }

    /// Rows of the translation table in ascending host order, header first.
    #[must_use]
    pub fn serialize_table(&self) -> Vec<TableEntry> {
        let mut table = Vec::with_capacity(self.segments.len() + 1);
        table.push(TableEntry {
            host_begin: self.segments.len(),
            host_end: TABLE_FORMAT_VERSION,
            device_begin: 0,
        });
        table.extend(self.segments.values().map(|s| TableEntry {
            host_begin: s.host_begin,
            host_end: s.host_end,
            device_begin: s.device_begin.unwrap_or(0),
        }));
        table
    }

    /// Send the table to the device, growing its buffer when it no longer fits. Returns the
    /// device address of the table and its row count, header included.
    ///
    /// # Errors
    /// Propagates allocation and transfer failures.
    pub fn transfer_table(&mut self, io: &DeviceIo<'_>) -> OffloadResult<(DeviceAddr, usize)> {
        let table = self.serialize_table();
        let bytes = TableEntry::to_bytes(&table);

        let buffer = match self.table {
            Some(buf) if buf.capacity >= bytes.len() => buf,
            old => {
                let capacity = bytes.len() + TABLE_SPARE_ENTRIES * TableEntry::SIZE;
                let device = io.allocate(capacity, None)?;
                self.table = Some(TableBuffer { device, capacity });
                if let Some(old) = old {
                    io.free(old.device)?;
                }
                TableBuffer { device, capacity }
            }
        };
        io.submit(buffer.device, &bytes)?;
        if let Some(perf) = io.perf {
            perf.sample_table_size(table.len());
        }
        log::debug!(
            "Transferred translation table: {} rows to {:#x}",
            table.len(),
            buffer.device
        );
        Ok((buffer.device, table.len()))
    }

    /// Free every segment's device storage and the table buffer.
    pub fn release(&mut self, io: &DeviceIo<'_>) {
        for seg in self.segments.values_mut() {
            if let Some(dev) = seg.device_begin.take() {
                let _ = io.free(dev);
            }
        }
        if let Some(buf) = self.table.take() {
            let _ = io.free(buf.device);
        }
    }

    pub fn dump(&self) {
        log::debug!("Segment list: {} segments", self.segments.len());
        for seg in self.segments.values() {
            log::debug!("\t{seg:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::PerfRecord;
    use crate::rtl::LoopbackBackend;
    use proptest::prelude::*;

    fn ranges(list: &SegmentList) -> Vec<(usize, usize)> {
        list.iter().map(|s| (s.host_begin, s.host_end)).collect()
    }

    fn io(backend: &LoopbackBackend) -> DeviceIo<'_> {
        DeviceIo {
            backend,
            device_id: 0,
            perf: None,
        }
    }

    #[test]
    fn close_ranges_merge() {
        let mut list = SegmentList::new(64);
        list.allocate(0, 100).unwrap();
        list.allocate(150, 100).unwrap();
        assert_eq!(ranges(&list), vec![(0, 250)]);
    }

    #[test]
    fn distant_ranges_stay_apart() {
        let mut list = SegmentList::new(64);
        list.allocate(0, 100).unwrap();
        list.allocate(1000, 100).unwrap();
        assert_eq!(ranges(&list), vec![(0, 100), (1000, 1100)]);
    }

    #[test]
    fn same_range_twice_is_one_segment() {
        let mut list = SegmentList::new(64);
        list.allocate(0x1000, 0x40).unwrap();
        list.allocate(0x1000, 0x40).unwrap();
        assert_eq!(ranges(&list), vec![(0x1000, 0x1040)]);
    }

    #[test]
    fn bridging_range_absorbs_both_sides() {
        let mut list = SegmentList::new(16);
        list.allocate(0, 100).unwrap();
        list.allocate(200, 100).unwrap();
        list.allocate(400, 100).unwrap();
        assert_eq!(list.len(), 3);

        // Reaches from the first segment past the second, close to the third.
        list.allocate(90, 300).unwrap();
        assert_eq!(ranges(&list), vec![(0, 500)]);
    }

    #[test]
    fn range_below_every_segment_merges_upward() {
        let mut list = SegmentList::new(64);
        list.allocate(1000, 100).unwrap();
        list.allocate(900, 80).unwrap();
        assert_eq!(ranges(&list), vec![(900, 1100)]);
    }

    #[test]
    fn backed_segments_are_never_extended() {
        let backend = LoopbackBackend::new(1);
        let mut list = SegmentList::new(64);
        let data = vec![7u8; 0x100];
        let base = data.as_ptr() as usize;

        list.allocate(base, 0x80).unwrap();
        unsafe { list.plan_transfer(&io(&backend)).unwrap() };

        // Contained: nothing changes.
        list.allocate(base + 0x10, 0x10).unwrap();
        assert_eq!(list.len(), 1);

        // Overlapping the backed end.
        assert!(matches!(
            list.allocate(base + 0x40, 0x80),
            Err(OffloadError::Overlap { .. })
        ));
        // Overlapping the backed begin from below.
        assert!(matches!(
            list.allocate(base - 0x10, 0x20),
            Err(OffloadError::Overlap { .. })
        ));
        assert_eq!(list.len(), 1);

        // Adjacent ranges get their own segment.
        list.allocate(base + 0x80, 0x20).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.iter().filter(|s| s.is_backed()).count(), 1);
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut list = SegmentList::new(64);
        assert!(list.allocate(0x1000, 0).is_err());
        assert!(list.is_empty());
    }

    #[test]
    fn wrapping_range_is_rejected() {
        let mut list = SegmentList::new(64);
        list.allocate(usize::MAX - 0x100, 0x40).unwrap();
        let before = ranges(&list);

        assert!(matches!(
            list.allocate(usize::MAX - 8, 16),
            Err(OffloadError::AddressOverflow { size: 16, .. })
        ));
        assert_eq!(ranges(&list), before);
        assert!(list.lookup(usize::MAX - 8, 16).segment.is_none());
        assert!(list.lookup(usize::MAX - 0x100, usize::MAX).segment.is_none());
    }

    #[test]
    fn lookup_classifies_ranges() {
        let mut list = SegmentList::new(8);
        list.allocate(0x1000, 0x100).unwrap();
        list.allocate(0x2000, 0x100).unwrap();

        assert!(list.lookup(0x1010, 0x10).flags.is_contained);
        assert!(list.lookup(0x10f0, 0x20).flags.extends_after);
        let before = list.lookup(0x1ff0, 0x20);
        assert!(before.flags.extends_before);
        assert_eq!(before.segment.map(|s| s.host_begin), Some(0x2000));
        assert!(list.lookup(0x800, 0x10).segment.is_none());
        assert!(list.lookup(0x1800, 0x10).segment.is_none());

        // Nothing is backed yet.
        assert_eq!(list.device_address(0x1010, 0x10), None);
    }

    #[test]
    fn planned_transfer_backs_and_fills_segments() {
        let backend = LoopbackBackend::new(1);
        let mut list = SegmentList::new(64);
        let data: Vec<u8> = (0..=255).collect();
        let base = data.as_ptr() as usize;

        list.allocate(base, 64).unwrap();
        list.allocate(base + 100, 28).unwrap();
        assert_eq!(list.len(), 1);
        unsafe { list.plan_transfer(&io(&backend)).unwrap() };

        let dev = list.device_address(base + 100, 4).unwrap();
        assert_eq!(backend.peek(0, dev, 4).unwrap(), vec![100, 101, 102, 103]);
        assert_eq!(backend.stats(0).unwrap().submitted_bytes, 128);

        // A second plan finds nothing to do.
        unsafe { list.plan_transfer(&io(&backend)).unwrap() };
        assert_eq!(backend.stats(0).unwrap().submits, 1);
    }

    #[test]
    fn submit_and_retrieve_through_segments() {
        let backend = LoopbackBackend::new(1);
        let mut list = SegmentList::new(64);
        let mut data = [1u64, 2, 3, 4];
        let base = data.as_mut_ptr() as usize;

        list.allocate(base, 32).unwrap();
        assert!(!unsafe { list.submit_if_backed(&io(&backend), base, 8).unwrap() });
        unsafe { list.plan_transfer(&io(&backend)).unwrap() };

        data[1] = 20;
        assert!(unsafe { list.submit_if_backed(&io(&backend), base + 8, 8).unwrap() });
        let dev = list.device_address(base, 32).unwrap();
        assert_eq!(backend.peek_word(0, dev + 8).unwrap(), 20);

        backend.poke(0, dev + 24, &40u64.to_ne_bytes()).unwrap();
        unsafe { list.retrieve(&io(&backend), base + 24, 8).unwrap() };
        assert_eq!(data[3], 40);

        assert!(matches!(
            unsafe { list.retrieve(&io(&backend), 0x10, 8) },
            Err(OffloadError::NotMapped(0x10))
        ));
    }

    #[test]
    fn table_is_ascending_with_count_header() {
        let mut list = SegmentList::new(16);
        list.allocate(0x3000, 0x10).unwrap();
        list.allocate(0x1000, 0x10).unwrap();
        list.allocate(0x2000, 0x10).unwrap();

        let table = list.serialize_table();
        assert_eq!(
            table[0],
            TableEntry { host_begin: 3, host_end: TABLE_FORMAT_VERSION, device_begin: 0 }
        );
        let begins: Vec<usize> = table[1..].iter().map(|r| r.host_begin).collect();
        assert_eq!(begins, vec![0x1000, 0x2000, 0x3000]);

        let bytes = TableEntry::to_bytes(&table);
        assert_eq!(bytes.len(), 4 * 3 * WORD_SIZE);
        assert_eq!(&bytes[..WORD_SIZE], &3usize.to_ne_bytes());
        assert_eq!(
            &bytes[TableEntry::SIZE..TableEntry::SIZE + WORD_SIZE],
            &0x1000usize.to_ne_bytes()
        );
        assert_eq!(std::mem::size_of::<TableEntry>(), TableEntry::SIZE);
    }

    #[test]
    fn device_lookup_agrees_with_segments() {
        let backend = LoopbackBackend::new(1);
        let mut list = SegmentList::new(16);
        let data = vec![0u8; 0x4000];
        let base = data.as_ptr() as usize;
        for off in [0x0, 0x800, 0x1000, 0x2400, 0x3f00] {
            list.allocate(base + off, 0x40).unwrap();
        }
        unsafe { list.plan_transfer(&io(&backend)).unwrap() };

        let table = list.serialize_table();
        for off in (0..0x4000).step_by(0x20) {
            let addr = base + off;
            assert_eq!(device_lookup(&table, addr), list.device_address(addr, 1));
        }
        assert_eq!(device_lookup(&[], base), None);

        let mut stale = table.clone();
        stale[0].host_end = TABLE_FORMAT_VERSION + 1;
        assert_eq!(device_lookup(&stale, base), None);
        assert!(device_lookup(&table, base).is_some());
    }

    #[test]
    fn table_buffer_grows_with_spare_rows() {
        let backend = LoopbackBackend::new(1);
        let perf = PerfRecord::new();
        let io = DeviceIo {
            backend: &backend,
            device_id: 0,
            perf: Some(&perf),
        };
        let mut list = SegmentList::new(16);
        list.allocate(0x1000, 0x10).unwrap();

        let (first, rows) = list.transfer_table(&io).unwrap();
        assert_eq!(rows, 2);
        assert_eq!(list.table_buffer(), Some((first, 6 * TableEntry::SIZE)));

        for i in 2..=5 {
            list.allocate(0x1000 * i, 0x10).unwrap();
        }
        let (same, rows) = list.transfer_table(&io).unwrap();
        assert_eq!((same, rows), (first, 6));

        list.allocate(0x9000, 0x10).unwrap();
        let (moved, rows) = list.transfer_table(&io).unwrap();
        assert_eq!(rows, 7);
        assert_ne!(moved, first);
        let stats = backend.stats(0).unwrap();
        assert_eq!((stats.allocations, stats.frees), (2, 1));
        assert_eq!(backend.peek_word(0, moved).unwrap(), 6);
        assert_eq!(perf.table_sizes(), vec![2, 6, 7]);
    }

    proptest! {
        #[test]
        fn segments_stay_disjoint_and_backed_ones_fixed(
            threshold in 1usize..256,
            ops in prop::collection::vec((0usize..4096, 1usize..256, any::<bool>()), 1..60)
        ) {
            let mut list = SegmentList::new(threshold);
            for (begin, size, back) in ops {
                if back {
                    for seg in list.segments.values_mut() {
                        seg.device_begin.get_or_insert(seg.host_begin + 0x10_0000);
                    }
                }
                let before = list.segments.clone();

                if list.allocate(begin, size).is_err() {
                    prop_assert_eq!(&list.segments, &before);
                    continue;
                }

                for (&key, seg) in &list.segments {
                    prop_assert_eq!(key, seg.host_begin);
                    prop_assert!(seg.host_begin < seg.host_end);
                }
                let segs: Vec<&Segment> = list.iter().collect();
                for pair in segs.windows(2) {
                    prop_assert!(pair[0].host_end <= pair[1].host_begin);
                }
                prop_assert!(
                    segs.iter().any(|s| s.host_begin <= begin && begin + size <= s.host_end)
                );
                for (key, seg) in before.iter().filter(|(_, s)| s.is_backed()) {
                    prop_assert_eq!(list.segments.get(key), Some(seg));
                }
            }
        }
    }
}
