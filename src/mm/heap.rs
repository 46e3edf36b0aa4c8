#![allow(clippy::cast_ptr_alignment)]

use crate::rtl::DeviceAddr;
use crate::utils::{align_up, checked_align_up};
use std::ptr;
use std::slice;

/// Block alignment; every block size and every payload address is a multiple of this.
pub const ALIGNMENT: usize = 16;

/// Bytes reserved in front of every payload.
pub const HEADER_SIZE: usize = align_up(size_of::<BlockHeader>(), ALIGNMENT);

/// Pages in a context's first heap.
pub const DEFAULT_HEAP_PAGES: usize = 1;

/// Block size for a payload of `size` bytes, header included. `None` when that does not fit
/// in the address space.
#[must_use]
pub const fn block_size(size: usize) -> Option<usize> {
    match size.checked_add(HEADER_SIZE) {
        Some(total) => checked_align_up(total, ALIGNMENT),
        None => None,
    }
}

/// Header prefixing every block. The low bit of `size` marks the block as in use.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    size: usize,
}

impl BlockHeader {
    const USED: usize = 1;

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size & !Self::USED
    }

    #[must_use]
    pub const fn is_used(&self) -> bool {
        self.size & Self::USED != 0
    }
}

/// A block as seen by a header walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: usize,
    pub size: usize,
    pub used: bool,
}

/// One growable arena of device-shadow memory.
///
/// Heaps of a context form a circular list through `next`/`prev`, which are indices into the
/// owning context's heap table.
#[derive(Debug)]
pub struct Heap {
    begin: usize,
    end: usize,
    next_free: usize,
    page_count: usize,
    device: Option<DeviceAddr>,
    device_len: usize,
    pub(crate) next: usize,
    pub(crate) prev: usize,
}

impl Heap {
    /// Set up a heap over `[begin, begin + len)` consisting of one free block.
    ///
    /// # Safety
    /// The range must be committed, writable, 16-byte aligned memory that nothing else uses
    /// for as long as the heap exists.
    pub unsafe fn init(begin: usize, len: usize, page_count: usize) -> Self {
        unsafe { write_header(begin, len, false) };
        Self {
            begin,
            end: begin + len,
            next_free: begin,
            page_count,
            device: None,
            device_len: 0,
            next: 0,
            prev: 0,
        }
    }

    #[must_use]
    pub const fn begin(&self) -> usize {
        self.begin
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.begin
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == self.begin
    }

    #[must_use]
    pub const fn next_free(&self) -> usize {
        self.next_free
    }

    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.page_count
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }

    /// Bytes from `begin` up to the next-fit cursor; everything handed out lies below it.
    #[must_use]
    pub const fn in_use(&self) -> usize {
        self.next_free - self.begin
    }

    /// Device storage mirroring this heap, once allocated.
    #[must_use]
    pub const fn device(&self) -> Option<DeviceAddr> {
        self.device
    }

    #[must_use]
    pub const fn device_len(&self) -> usize {
        self.device_len
    }

    pub(crate) const fn set_device(&mut self, addr: DeviceAddr, len: usize) {
        self.device = Some(addr);
        self.device_len = len;
    }

    pub(crate) const fn clear_device(&mut self) {
        self.device = None;
        self.device_len = 0;
    }

    /// Device address mirroring `addr`, if the heap is backed and contains it.
    #[must_use]
    pub fn translate(&self, addr: usize) -> Option<DeviceAddr> {
        if !self.contains(addr) {
            return None;
        }
        self.device.map(|dev| dev + (addr - self.begin))
    }

    /// Next-fit search for a block of exactly `size` bytes (already aligned, header included),
    /// starting at the cursor. The found block is marked used and its header address returned.
    ///
    /// A free block is split when the remainder can hold more than a header; otherwise it is
    /// handed out whole. A corrupt header ends the search without a fit.
    pub fn find_fit(&mut self, size: usize) -> Option<usize> {
        debug_assert_eq!(size % ALIGNMENT, 0);

        let mut curr = self.next_free;
        while curr < self.end {
            let hdr = unsafe { read_header(curr) };
            let blk_size = hdr.size();
            if blk_size == 0 {
                log::error!("Corrupt block header at {curr:#x} in heap {:#x}", self.begin);
                return None;
            }

            if !hdr.is_used() && blk_size >= size {
                let taken = if size + HEADER_SIZE < blk_size {
                    unsafe { write_header(curr + size, blk_size - size, false) };
                    size
                } else {
                    blk_size
                };
                unsafe { write_header(curr, taken, true) };
                self.next_free = curr + taken;
                return Some(curr);
            }
            curr = curr.checked_add(blk_size)?;
        }
        None
    }

    /// Account for `extra` bytes appended to the heap's mapping right after `end`.
    ///
    /// # Safety
    /// `[end, end + extra)` must already be committed and writable.
    pub unsafe fn grow(&mut self, extra: usize, page_size: usize) {
        let tail = (self.next_free < self.end)
            .then(|| unsafe { read_header(self.next_free) })
            .filter(|hdr| !hdr.is_used() && self.next_free + hdr.size() == self.end);

        match tail {
            Some(hdr) => unsafe { write_header(self.next_free, hdr.size() + extra, false) },
            None => unsafe { write_header(self.end, extra, false) },
        }

        self.end += extra;
        self.page_count += extra / page_size;
    }

    /// Size of the block whose payload starts at `payload`.
    #[must_use]
    pub fn payload_capacity(&self, payload: usize) -> Option<usize> {
        let header = payload.checked_sub(HEADER_SIZE)?;
        if !self.contains(header) {
            return None;
        }
        let hdr = unsafe { read_header(header) };
        hdr.is_used().then(|| hdr.size() - HEADER_SIZE)
    }

    /// Walk every block from `begin` following the size fields.
    #[must_use]
    pub const fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            curr: self.begin,
        }
    }

    /// The in-use prefix of the heap.
    #[must_use]
    pub fn used_bytes(&self) -> &[u8] {
        // SAFETY: `init` guarantees the range is committed and owned by this heap.
        unsafe { slice::from_raw_parts(self.begin as *const u8, self.in_use()) }
    }

    /// The in-use prefix of the heap, writable.
    pub fn used_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for `used_bytes`; `&mut self` makes the access exclusive.
        unsafe { slice::from_raw_parts_mut(self.begin as *mut u8, self.in_use()) }
    }
}

/// Iterator over the blocks of a heap.
#[derive(Debug)]
pub struct Blocks<'a> {
    heap: &'a Heap,
    curr: usize,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.curr >= self.heap.end {
            return None;
        }
        let hdr = unsafe { read_header(self.curr) };
        let info = BlockInfo {
            addr: self.curr,
            size: hdr.size(),
            used: hdr.is_used(),
        };
        // A zero size would loop forever; treat it as the end of the walk.
        self.curr = if info.size == 0 {
            self.heap.end
        } else {
            self.curr + info.size
        };
        Some(info)
    }
}

unsafe fn read_header(addr: usize) -> BlockHeader {
    unsafe { ptr::read(addr as *const BlockHeader) }
}

unsafe fn write_header(addr: usize, size: usize, used: bool) {
    let size = if used { size | BlockHeader::USED } else { size };
    unsafe { ptr::write(addr as *mut BlockHeader, BlockHeader { size }) };
}
