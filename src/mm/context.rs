use crate::error::{OffloadError, OffloadResult};
use crate::mm::heap::{HEADER_SIZE, Heap, block_size};
use crate::mm::layout::AddressLayout;
use crate::mm::region::AddressReservation;
use crate::mm::{HeapGrowth, HeapPlacement};
use crate::rtl::{DeviceAddr, DeviceBackend};
use crate::utils::{checked_align_up, page_size};
use std::iter;

/// Everything a context needs to carve out and back new heaps.
#[derive(Clone, Copy)]
pub(crate) struct HeapSource<'a> {
    pub backend: &'a dyn DeviceBackend,
    pub reservation: &'a AddressReservation,
    pub layout: &'a AddressLayout,
    pub placement: HeapPlacement,
    pub growth: HeapGrowth,
}

/// One logical offload context: a slice of the shadow window and the circular list of heaps
/// carved out of it.
#[derive(Debug)]
pub struct MmContext {
    id: usize,
    device_id: i32,
    slice: usize,
    slice_end: usize,
    // Next unused shadow address for table placement.
    cursor: usize,
    heaps: Vec<Heap>,
    head: usize,
    current: usize,
}

impl MmContext {
    pub(crate) fn create(
        id: usize,
        device_id: i32,
        first_heap_pages: usize,
        src: HeapSource<'_>,
    ) -> OffloadResult<Self> {
        let slice_base = src
            .layout
            .slice_base(id)
            .ok_or(OffloadError::AddressSpaceExhausted)?;

        let mut ctx = Self {
            id,
            device_id,
            slice: id,
            slice_end: slice_base + src.layout.slice_size(),
            cursor: slice_base,
            heaps: Vec::new(),
            head: 0,
            current: 0,
        };

        let first = ctx.new_heap(first_heap_pages, src)?;
        ctx.heaps.push(first);
        log::debug!("Created mm context #{id} for device {device_id} at {slice_base:#x}");
        Ok(ctx)
    }

    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub const fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Heaps in list order, starting with the first one created.
    pub fn heaps(&self) -> impl Iterator<Item = &Heap> {
        self.ring().map(|idx| &self.heaps[idx])
    }

    #[must_use]
    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    #[must_use]
    pub fn current_heap(&self) -> &Heap {
        &self.heaps[self.current]
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.heaps.iter().any(|h| h.contains(addr))
    }

    /// Device address mirroring the shadow address `addr`.
    #[must_use]
    pub fn translate(&self, addr: usize) -> Option<DeviceAddr> {
        self.heaps.iter().find_map(|h| h.translate(addr))
    }

    /// Payload bytes available behind an address this context handed out.
    #[must_use]
    pub fn payload_capacity(&self, addr: usize) -> Option<usize> {
        self.heaps
            .iter()
            .find(|h| h.contains(addr))
            .and_then(|h| h.payload_capacity(addr))
    }

    fn ring(&self) -> impl Iterator<Item = usize> + '_ {
        let head = self.head;
        iter::successors(Some(head), move |&idx| {
            let next = self.heaps[idx].next;
            (next != head).then_some(next)
        })
    }

    pub(crate) fn allocate(&mut self, size: usize, src: HeapSource<'_>) -> OffloadResult<usize> {
        let blk = block_size(size).ok_or(OffloadError::OutOfMemory(size))?;
        loop {
            if let Some(hdr) = self.heaps[self.current].find_fit(blk) {
                return Ok(hdr + HEADER_SIZE);
            }
            self.grow(blk, src)?;
        }
    }

    fn grow(&mut self, blk: usize, src: HeapSource<'_>) -> OffloadResult<()> {
        // In-place growth needs the current heap to sit at the end of the carved-out part of
        // the slice; masked heaps are pinned to their device block and can only relocate.
        let extendable = src.growth == HeapGrowth::InPlace
            && src.placement == HeapPlacement::Table
            && self.heaps[self.current].end() == self.cursor;

        if extendable {
            self.extend_current(blk, src)
        } else {
            self.relocate(blk, src)
        }
    }

    fn extend_current(&mut self, blk: usize, src: HeapSource<'_>) -> OffloadResult<()> {
        let heap = &mut self.heaps[self.current];
        let mut extra = heap.len();
        while extra < blk {
            extra = extra
                .checked_mul(2)
                .ok_or(OffloadError::AddressSpaceExhausted)?;
        }

        let end = heap.end();
        if end.checked_add(extra).is_none_or(|e| e > self.slice_end) {
            return Err(OffloadError::AddressSpaceExhausted);
        }
        src.reservation.register(end, extra)?;
        // SAFETY: `register` just committed `[end, end + extra)` inside our slice.
        unsafe { heap.grow(extra, page_size()) };
        self.cursor = heap.end();

        log::debug!(
            "Context #{}: heap {:#x} grown in place to {:#x} bytes",
            self.id,
            heap.begin(),
            heap.len()
        );
        Ok(())
    }

    fn relocate(&mut self, blk: usize, src: HeapSource<'_>) -> OffloadResult<()> {
        let curr = &self.heaps[self.current];
        let pages = if blk >= curr.len() {
            blk.checked_mul(2)
                .and_then(|b| checked_align_up(b, page_size()))
                .ok_or(OffloadError::AddressSpaceExhausted)?
                / page_size()
        } else {
            curr.page_count()
        };

        let mut heap = self.new_heap(pages, src)?;
        let idx = self.heaps.len();
        let next = self.heaps[self.current].next;
        heap.prev = self.current;
        heap.next = next;
        self.heaps.push(heap);
        self.heaps[self.current].next = idx;
        self.heaps[next].prev = idx;
        self.current = idx;
        Ok(())
    }

    fn new_heap(&mut self, pages: usize, src: HeapSource<'_>) -> OffloadResult<Heap> {
        let pages = pages.max(1);
        let len = pages
            .checked_mul(page_size())
            .filter(|&len| len <= src.layout.slice_size())
            .ok_or(OffloadError::AddressSpaceExhausted)?;

        let (begin, device) = match src.placement {
            HeapPlacement::Masked => {
                let dev = src
                    .backend
                    .allocate(self.device_id, len, None)
                    .ok_or(OffloadError::OutOfMemory(len))?;
                match self.masked_shadow(dev, len, src) {
                    Ok(begin) => (begin, Some(dev)),
                    Err(e) => {
                        if let Err(free_err) = src.backend.free(self.device_id, dev) {
                            log::error!("Failed to release device block {dev:#x}: {free_err}");
                        }
                        return Err(e);
                    }
                }
            }
            HeapPlacement::Table => {
                let begin = self.cursor;
                if begin.checked_add(len).is_none_or(|e| e > self.slice_end) {
                    return Err(OffloadError::AddressSpaceExhausted);
                }
                src.reservation.register(begin, len)?;
                self.cursor += len;
                (begin, None)
            }
        };

        // SAFETY: the range was committed above and lies in this context's slice, outside
        // every other heap.
        let mut heap = unsafe { Heap::init(begin, len, pages) };
        if let Some(dev) = device {
            heap.set_device(dev, len);
        }
        if pages > 1 {
            log::debug!("Context #{}: new heap {begin:#x}+{len:#x}", self.id);
        }
        Ok(heap)
    }

    fn masked_shadow(&self, dev: DeviceAddr, len: usize, src: HeapSource<'_>) -> OffloadResult<usize> {
        let begin = src
            .layout
            .shadow_of(self.slice, dev)
            .ok_or(OffloadError::AddressSpaceExhausted)?;
        let end = begin
            .checked_add(len)
            .filter(|&e| e <= self.slice_end)
            .ok_or(OffloadError::AddressSpaceExhausted)?;
        if self.heaps.iter().any(|h| h.begin() < end && begin < h.end()) {
            return Err(OffloadError::General(format!(
                "device block {dev:#x} maps onto an existing heap at {begin:#x}"
            )));
        }
        src.reservation.register(begin, len)?;
        Ok(begin)
    }

    /// Copy the in-use part of every heap to the device.
    pub(crate) fn submit(&mut self, backend: &dyn DeviceBackend) -> OffloadResult<()> {
        let order: Vec<usize> = self.ring().collect();
        for idx in order {
            if self.heaps[idx].in_use() == 0 {
                continue;
            }
            let dev = self.ensure_device(idx, backend)?;
            backend.submit(self.device_id, dev, self.heaps[idx].used_bytes())?;
        }
        Ok(())
    }

    /// Copy the in-use part of every heap back from the device.
    pub(crate) fn retrieve(&mut self, backend: &dyn DeviceBackend) -> OffloadResult<()> {
        let order: Vec<usize> = self.ring().collect();
        for idx in order {
            let heap = &mut self.heaps[idx];
            if heap.in_use() == 0 {
                continue;
            }
            let Some(dev) = heap.device() else {
                log::warn!(
                    "Context #{}: heap {:#x} was never submitted, skipping retrieve",
                    self.id,
                    heap.begin()
                );
                continue;
            };
            backend.retrieve(self.device_id, heap.used_bytes_mut(), dev)?;
        }
        Ok(())
    }

    fn ensure_device(&mut self, idx: usize, backend: &dyn DeviceBackend) -> OffloadResult<DeviceAddr> {
        let heap = &mut self.heaps[idx];
        if let Some(dev) = heap.device()
            && heap.device_len() >= heap.len()
        {
            return Ok(dev);
        }

        if let Some(old) = heap.device() {
            backend.free(self.device_id, old)?;
            heap.clear_device();
        }
        let len = heap.len();
        let dev = backend
            .allocate(self.device_id, len, Some(heap.begin()))
            .ok_or(OffloadError::OutOfMemory(len))?;
        heap.set_device(dev, len);
        Ok(dev)
    }

    /// Hand every heap's device storage back to the backend.
    pub(crate) fn release(&mut self, backend: &dyn DeviceBackend) {
        for heap in &mut self.heaps {
            if let Some(dev) = heap.device() {
                if let Err(e) = backend.free(self.device_id, dev) {
                    log::error!("Context #{}: failed to free heap storage {dev:#x}: {e}", self.id);
                }
                heap.clear_device();
            }
        }
    }
}
