//! Where device storage for a mapped range comes from, one implementation per
//! [`MappingMode`].

use crate::config::{Config, MappingMode};
use crate::error::{OffloadError, OffloadResult};
use crate::mm::DeviceAllocator;
use crate::omptarget::io::DeviceIo;
use crate::omptarget::map::{AddressMap, MappingEntry};
use crate::omptarget::segment::SegmentList;
use crate::rtl::{DeviceAddr, HostAddr};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Backing of mapped ranges for one device. Every call happens under the device's state
/// lock, next to the [`AddressMap`] it serves.
pub trait BackingStrategy: Send + fmt::Debug {
    fn mode(&self) -> MappingMode;

    /// Device storage for a range about to be inserted into the map.
    ///
    /// # Errors
    /// Allocation failures.
    fn allocate(&mut self, io: &DeviceIo<'_>, begin: HostAddr, size: usize)
    -> OffloadResult<DeviceAddr>;

    /// Release the storage of an entry the map just removed.
    ///
    /// # Errors
    /// Backend failures.
    fn deallocate(&mut self, io: &DeviceIo<'_>, entry: &MappingEntry) -> OffloadResult<()>;

    /// Copy a mapped host range to its device storage.
    ///
    /// # Safety
    /// `[begin, begin + size)` must be readable.
    ///
    /// # Errors
    /// Transfer failures.
    unsafe fn submit(
        &mut self,
        io: &DeviceIo<'_>,
        begin: HostAddr,
        device: DeviceAddr,
        size: usize,
    ) -> OffloadResult<()> {
        // SAFETY: forwarded from the caller.
        unsafe { io.submit_host(device, begin, size) }
    }

    /// Copy a mapped range back to the host.
    ///
    /// # Safety
    /// `[begin, begin + size)` must be writable.
    ///
    /// # Errors
    /// Transfer failures.
    unsafe fn retrieve(
        &mut self,
        io: &DeviceIo<'_>,
        begin: HostAddr,
        device: DeviceAddr,
        size: usize,
    ) -> OffloadResult<()> {
        // SAFETY: forwarded from the caller.
        unsafe { io.retrieve_host(begin, device, size) }
    }

    /// Device address a kernel should see for `begin`, given what the map found.
    fn resolve(&self, _begin: HostAddr, _size: usize, map_hit: Option<DeviceAddr>) -> Option<DeviceAddr> {
        map_hit
    }

    /// Work deferred to the end of a mapping phase.
    ///
    /// # Safety
    /// Every host range mapped since the last phase must still be readable.
    ///
    /// # Errors
    /// Allocation and transfer failures.
    unsafe fn end_phase(&mut self, _io: &DeviceIo<'_>) -> OffloadResult<()> {
        Ok(())
    }

    /// Device translation table and its row count, in address-translate mode.
    fn table(&self) -> Option<(DeviceAddr, usize)> {
        None
    }

    /// Whether the end of a phase also sends the translation table.
    fn set_table_transfer(&mut self, _enabled: bool) {}

    /// Free everything still held for `map` at teardown. User associations are left alone.
    fn release(&mut self, io: &DeviceIo<'_>, map: &AddressMap) {
        for entry in map.iter().filter(|e| !e.ref_count.is_infinite()) {
            if let Err(e) = self.deallocate(io, entry) {
                log::warn!("Leaking device storage of {:#x}: {e}", entry.host_begin);
            }
        }
    }

    fn dump(&self) {}
}

/// Pick the strategy for `config.mode`. Masking needs the shared allocator.
///
/// # Errors
/// Returns `Unsupported` for masking mode without an allocator.
pub fn for_mode(
    config: &Config,
    allocator: Option<Arc<Mutex<DeviceAllocator>>>,
) -> OffloadResult<Box<dyn BackingStrategy>> {
    Ok(match config.mode {
        MappingMode::Direct => Box::new(DirectStrategy),
        MappingMode::Bulk | MappingMode::AddressTranslate => Box::new(BulkStrategy::new(
            config.page_threshold,
            config.mode == MappingMode::AddressTranslate,
        )),
        MappingMode::Masking => Box::new(MaskedStrategy {
            allocator: allocator.ok_or(OffloadError::Unsupported("masking without allocator"))?,
        }),
        MappingMode::Unified => Box::new(UnifiedStrategy),
    })
}

/// One backend allocation per mapped range.
#[derive(Debug, Default)]
pub struct DirectStrategy;

impl BackingStrategy for DirectStrategy {
    fn mode(&self) -> MappingMode {
        MappingMode::Direct
    }

    fn allocate(
        &mut self,
        io: &DeviceIo<'_>,
        begin: HostAddr,
        size: usize,
    ) -> OffloadResult<DeviceAddr> {
        io.allocate(size, Some(begin))
    }

    fn deallocate(&mut self, io: &DeviceIo<'_>, entry: &MappingEntry) -> OffloadResult<()> {
        io.free(entry.device_begin)
    }
}

/// Ranges merge into segments; storage and data move at the end of the phase.
#[derive(Debug)]
pub struct BulkStrategy {
    segments: SegmentList,
    transfer_table: bool,
    table: Option<(DeviceAddr, usize)>,
}

impl BulkStrategy {
    #[must_use]
    pub fn new(threshold: usize, transfer_table: bool) -> Self {
        Self {
            segments: SegmentList::new(threshold),
            transfer_table,
            table: None,
        }
    }

    #[must_use]
    pub const fn segments(&self) -> &SegmentList {
        &self.segments
    }
}

impl BackingStrategy for BulkStrategy {
    fn mode(&self) -> MappingMode {
        if self.transfer_table {
            MappingMode::AddressTranslate
        } else {
            MappingMode::Bulk
        }
    }

    /// The map records the host address itself; the segment is backed later.
    fn allocate(
        &mut self,
        _io: &DeviceIo<'_>,
        begin: HostAddr,
        size: usize,
    ) -> OffloadResult<DeviceAddr> {
        self.segments.allocate(begin, size)?;
        Ok(begin)
    }

    fn deallocate(&mut self, _io: &DeviceIo<'_>, _entry: &MappingEntry) -> OffloadResult<()> {
        Ok(())
    }

    unsafe fn submit(
        &mut self,
        io: &DeviceIo<'_>,
        begin: HostAddr,
        _device: DeviceAddr,
        size: usize,
    ) -> OffloadResult<()> {
        // SAFETY: forwarded from the caller.
        unsafe { self.segments.submit_if_backed(io, begin, size) }.map(|_| ())
    }

    unsafe fn retrieve(
        &mut self,
        io: &DeviceIo<'_>,
        begin: HostAddr,
        _device: DeviceAddr,
        size: usize,
    ) -> OffloadResult<()> {
        // SAFETY: forwarded from the caller.
        unsafe { self.segments.retrieve(io, begin, size) }
    }

    fn resolve(&self, begin: HostAddr, size: usize, _map_hit: Option<DeviceAddr>) -> Option<DeviceAddr> {
        self.segments.device_address(begin, size)
    }

    unsafe fn end_phase(&mut self, io: &DeviceIo<'_>) -> OffloadResult<()> {
        // SAFETY: forwarded from the caller.
        unsafe { self.segments.plan_transfer(io)? };
        if self.transfer_table {
            self.table = Some(self.segments.transfer_table(io)?);
        }
        Ok(())
    }

    fn table(&self) -> Option<(DeviceAddr, usize)> {
        self.table
    }

    fn set_table_transfer(&mut self, enabled: bool) {
        self.transfer_table = enabled;
    }

    fn release(&mut self, io: &DeviceIo<'_>, _map: &AddressMap) {
        self.segments.release(io);
        self.table = None;
    }

    fn dump(&self) {
        self.segments.dump();
    }
}

/// Engine-allocated ranges already have device storage at a known offset; anything else is
/// allocated directly.
#[derive(Debug)]
pub struct MaskedStrategy {
    allocator: Arc<Mutex<DeviceAllocator>>,
}

impl MaskedStrategy {
    fn shadow_translate(&self, addr: HostAddr) -> OffloadResult<Option<DeviceAddr>> {
        let alloc = self
            .allocator
            .lock()
            .map_err(|_| OffloadError::General("allocator lock poisoned".into()))?;
        if !alloc.is_device_shadow(addr) {
            return Ok(None);
        }
        alloc
            .translate(addr)
            .map(Some)
            .ok_or(OffloadError::NotMapped(addr))
    }
}

impl BackingStrategy for MaskedStrategy {
    fn mode(&self) -> MappingMode {
        MappingMode::Masking
    }

    fn allocate(
        &mut self,
        io: &DeviceIo<'_>,
        begin: HostAddr,
        size: usize,
    ) -> OffloadResult<DeviceAddr> {
        match self.shadow_translate(begin)? {
            Some(dev) => Ok(dev),
            None => io.allocate(size, Some(begin)),
        }
    }

    fn deallocate(&mut self, io: &DeviceIo<'_>, entry: &MappingEntry) -> OffloadResult<()> {
        // Heap storage belongs to the allocator.
        if self.shadow_translate(entry.host_begin)?.is_some() {
            return Ok(());
        }
        io.free(entry.device_begin)
    }

    fn resolve(&self, begin: HostAddr, _size: usize, map_hit: Option<DeviceAddr>) -> Option<DeviceAddr> {
        map_hit.or_else(|| self.shadow_translate(begin).ok().flatten())
    }
}

/// Host and device share memory: every address is its own device address.
#[derive(Debug, Default)]
pub struct UnifiedStrategy;

impl BackingStrategy for UnifiedStrategy {
    fn mode(&self) -> MappingMode {
        MappingMode::Unified
    }

    fn allocate(
        &mut self,
        _io: &DeviceIo<'_>,
        begin: HostAddr,
        _size: usize,
    ) -> OffloadResult<DeviceAddr> {
        Ok(begin)
    }

    fn deallocate(&mut self, _io: &DeviceIo<'_>, _entry: &MappingEntry) -> OffloadResult<()> {
        Ok(())
    }

    unsafe fn submit(
        &mut self,
        _io: &DeviceIo<'_>,
        _begin: HostAddr,
        _device: DeviceAddr,
        _size: usize,
    ) -> OffloadResult<()> {
        Ok(())
    }

    unsafe fn retrieve(
        &mut self,
        _io: &DeviceIo<'_>,
        _begin: HostAddr,
        _device: DeviceAddr,
        _size: usize,
    ) -> OffloadResult<()> {
        Ok(())
    }

    fn resolve(&self, begin: HostAddr, _size: usize, _map_hit: Option<DeviceAddr>) -> Option<DeviceAddr> {
        Some(begin)
    }
}
