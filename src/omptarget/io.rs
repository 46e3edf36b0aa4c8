use crate::error::{OffloadError, OffloadResult};
use crate::perf::{PerfEvent, PerfRecord};
use crate::rtl::{DeviceAddr, DeviceBackend, HostAddr};
use std::slice;

/// A device's view of the backend: every transfer goes through here so it is timed once.
#[derive(Clone, Copy)]
pub struct DeviceIo<'a> {
    pub backend: &'a dyn DeviceBackend,
    pub device_id: i32,
    pub perf: Option<&'a PerfRecord>,
}

impl std::fmt::Debug for DeviceIo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIo")
            .field("device_id", &self.device_id)
            .field("perf", &self.perf.is_some())
            .finish_non_exhaustive()
    }
}

impl DeviceIo<'_> {
    /// # Errors
    /// Returns `OutOfMemory` when the backend has no room.
    pub fn allocate(&self, size: usize, hint: Option<HostAddr>) -> OffloadResult<DeviceAddr> {
        self.backend
            .allocate(self.device_id, size, hint)
            .ok_or_else(|| {
                log::error!("Device {}: failed to allocate {size:#x} bytes", self.device_id);
                OffloadError::OutOfMemory(size)
            })
    }

    /// # Errors
    /// Propagates backend failures.
    pub fn free(&self, addr: DeviceAddr) -> OffloadResult<()> {
        self.backend.free(self.device_id, addr).inspect_err(|e| {
            log::error!("Device {}: failed to free {addr:#x}: {e}", self.device_id);
        })
    }

    /// # Errors
    /// Propagates backend failures.
    pub fn submit(&self, dst: DeviceAddr, src: &[u8]) -> OffloadResult<()> {
        let _t = self.perf.map(|p| p.start(PerfEvent::HostToDevice));
        self.backend.submit(self.device_id, dst, src)
    }

    /// # Errors
    /// Propagates backend failures.
    pub fn retrieve(&self, dst: &mut [u8], src: DeviceAddr) -> OffloadResult<()> {
        let _t = self.perf.map(|p| p.start(PerfEvent::DeviceToHost));
        self.backend.retrieve(self.device_id, dst, src)
    }

    /// Copy `size` bytes of host memory at `host` to `dst`.
    ///
    /// # Safety
    /// `[host, host + size)` must be readable.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub unsafe fn submit_host(
        &self,
        dst: DeviceAddr,
        host: HostAddr,
        size: usize,
    ) -> OffloadResult<()> {
        if size == 0 {
            return Ok(());
        }
        // SAFETY: caller guarantees the range is readable.
        let src = unsafe { slice::from_raw_parts(host as *const u8, size) };
        self.submit(dst, src)
    }

    /// Copy `size` bytes at `src` into host memory at `host`.
    ///
    /// # Safety
    /// `[host, host + size)` must be writable and not aliased by live references.
    ///
    /// # Errors
    /// Propagates backend failures.
    pub unsafe fn retrieve_host(
        &self,
        host: HostAddr,
        src: DeviceAddr,
        size: usize,
    ) -> OffloadResult<()> {
        if size == 0 {
            return Ok(());
        }
        // SAFETY: caller guarantees the range is writable.
        let dst = unsafe { slice::from_raw_parts_mut(host as *mut u8, size) };
        self.retrieve(dst, src)
    }
}
