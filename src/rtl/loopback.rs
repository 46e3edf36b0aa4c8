//! A host-simulated device backend.
//!
//! Every simulated device owns an [`Aperture`] describing its address space and a set of
//! byte buffers standing in for device memory. Transfers copy between host slices and those
//! buffers, and the backend keeps counters so callers can verify exactly what moved.

use crate::error::{OffloadError, OffloadResult};
use crate::rtl::aperture::{Aperture, ApertureAllocator};
use crate::rtl::{DeviceAddr, DeviceBackend, HostAddr, OffloadMode};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Default start of every simulated device's address space (4 GiB aligned).
pub const LOOPBACK_BASE: DeviceAddr = 0x0000_0010_0000_0000;
/// Default size of every simulated device's address space.
pub const LOOPBACK_SIZE: usize = 0x1_0000_0000;
/// Default allocation alignment, one host page.
pub const LOOPBACK_ALIGN: usize = 4096;

/// Counters describing the traffic a simulated device has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub allocations: usize,
    pub frees: usize,
    pub submits: usize,
    pub submitted_bytes: usize,
    pub retrieves: usize,
    pub retrieved_bytes: usize,
    pub launches: usize,
}

/// A region launch as observed by the simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub entry: usize,
    pub args: Vec<usize>,
    pub offsets: Vec<isize>,
}

#[derive(Debug)]
struct SimDevice {
    aperture: Aperture,
    buffers: BTreeMap<DeviceAddr, Vec<u8>>,
    stats: TransferStats,
    launches: Vec<Launch>,
    initialized: bool,
}

impl SimDevice {
    fn new(base: DeviceAddr, size: usize, align: usize) -> Self {
        Self {
            aperture: Aperture::new(base, base + size, align),
            buffers: BTreeMap::new(),
            stats: TransferStats::default(),
            launches: Vec::new(),
            initialized: false,
        }
    }

    /// Locate the buffer holding `[addr, addr + len)` and return it with the offset of `addr`.
    fn buffer_mut(&mut self, addr: DeviceAddr, len: usize) -> OffloadResult<(&mut Vec<u8>, usize)> {
        let (&start, buf) = self
            .buffers
            .range_mut(..=addr)
            .next_back()
            .ok_or_else(|| OffloadError::Backend(format!("no device buffer at {addr:#x}")))?;
        let offset = addr - start;
        if offset + len > buf.len() {
            return Err(OffloadError::Backend(format!(
                "access {addr:#x}+{len:#x} exceeds buffer {start:#x}+{:#x}",
                buf.len()
            )));
        }
        Ok((buf, offset))
    }
}

#[derive(Debug)]
struct LoopbackState {
    devices: HashMap<i32, SimDevice>,
    mode: OffloadMode,
}

/// A [`DeviceBackend`] whose devices live in host memory.
#[derive(Debug)]
pub struct LoopbackBackend {
    num_devices: i32,
    supports_mode: bool,
    inner: Mutex<LoopbackState>,
}

impl LoopbackBackend {
    /// Create a backend exposing `num_devices` devices with the default address window.
    #[must_use]
    pub fn new(num_devices: i32) -> Self {
        Self::with_window(num_devices, LOOPBACK_BASE, LOOPBACK_SIZE, LOOPBACK_ALIGN)
    }

    /// Create a backend whose devices each span `[base, base + size)`.
    #[must_use]
    pub fn with_window(num_devices: i32, base: DeviceAddr, size: usize, align: usize) -> Self {
        let devices = (0..num_devices)
            .map(|id| (id, SimDevice::new(base, size, align)))
            .collect();

        Self {
            num_devices,
            supports_mode: true,
            inner: Mutex::new(LoopbackState {
                devices,
                mode: OffloadMode::Default,
            }),
        }
    }

    /// Disable `set_mode` support, mimicking an older plugin.
    #[must_use]
    pub const fn without_mode_support(mut self) -> Self {
        self.supports_mode = false;
        self
    }

    #[must_use]
    pub const fn num_devices(&self) -> i32 {
        self.num_devices
    }

    fn with_device<R>(
        &self,
        device_id: i32,
        f: impl FnOnce(&mut SimDevice) -> OffloadResult<R>,
    ) -> OffloadResult<R> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| OffloadError::Backend("loopback state poisoned".into()))?;
        let dev = guard
            .devices
            .get_mut(&device_id)
            .ok_or(OffloadError::InvalidDeviceId(device_id))?;
        f(dev)
    }

    /// Traffic counters for a device.
    pub fn stats(&self, device_id: i32) -> OffloadResult<TransferStats> {
        self.with_device(device_id, |dev| Ok(dev.stats))
    }

    /// Launches recorded on a device, oldest first.
    pub fn launches(&self, device_id: i32) -> OffloadResult<Vec<Launch>> {
        self.with_device(device_id, |dev| Ok(dev.launches.clone()))
    }

    /// Current execution mode.
    pub fn mode(&self) -> OffloadResult<OffloadMode> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| OffloadError::Backend("loopback state poisoned".into()))?;
        Ok(guard.mode)
    }

    /// Read `len` bytes of simulated device memory without touching the counters.
    pub fn peek(&self, device_id: i32, addr: DeviceAddr, len: usize) -> OffloadResult<Vec<u8>> {
        self.with_device(device_id, |dev| {
            let (buf, offset) = dev.buffer_mut(addr, len)?;
            Ok(buf[offset..offset + len].to_vec())
        })
    }

    /// Read one machine word of simulated device memory.
    pub fn peek_word(&self, device_id: i32, addr: DeviceAddr) -> OffloadResult<usize> {
        let bytes = self.peek(device_id, addr, crate::utils::WORD_SIZE)?;
        let mut word = [0u8; crate::utils::WORD_SIZE];
        word.copy_from_slice(&bytes);
        Ok(usize::from_ne_bytes(word))
    }

    /// Overwrite simulated device memory, e.g. to emulate a kernel writing results.
    pub fn poke(&self, device_id: i32, addr: DeviceAddr, bytes: &[u8]) -> OffloadResult<()> {
        self.with_device(device_id, |dev| {
            let (buf, offset) = dev.buffer_mut(addr, bytes.len())?;
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);
            Ok(())
        })
    }

    /// Number of live allocations on a device.
    pub fn live_allocations(&self, device_id: i32) -> OffloadResult<usize> {
        self.with_device(device_id, |dev| Ok(dev.buffers.len()))
    }
}

impl DeviceBackend for LoopbackBackend {
    fn init_device(&self, device_id: i32) -> OffloadResult<()> {
        self.with_device(device_id, |dev| {
            dev.initialized = true;
            Ok(())
        })
    }

    fn allocate(&self, device_id: i32, size: usize, _hint: Option<HostAddr>) -> Option<DeviceAddr> {
        self.with_device(device_id, |dev| {
            let addr = dev
                .aperture
                .allocate_va(size, 0)
                .ok_or(OffloadError::OutOfMemory(size))?;
            dev.buffers.insert(addr, vec![0u8; size.max(1)]);
            dev.stats.allocations += 1;
            Ok(addr)
        })
        .inspect_err(|e| log::debug!("Loopback allocate of {size:#x} failed: {e}"))
        .ok()
    }

    fn free(&self, device_id: i32, addr: DeviceAddr) -> OffloadResult<()> {
        self.with_device(device_id, |dev| {
            if dev.buffers.remove(&addr).is_none() {
                return Err(OffloadError::Backend(format!("free of unknown {addr:#x}")));
            }
            dev.aperture.free_va(addr);
            dev.stats.frees += 1;
            Ok(())
        })
    }

    fn submit(&self, device_id: i32, dst: DeviceAddr, src: &[u8]) -> OffloadResult<()> {
        self.with_device(device_id, |dev| {
            let (buf, offset) = dev.buffer_mut(dst, src.len())?;
            buf[offset..offset + src.len()].copy_from_slice(src);
            dev.stats.submits += 1;
            dev.stats.submitted_bytes += src.len();
            Ok(())
        })
    }

    fn retrieve(&self, device_id: i32, dst: &mut [u8], src: DeviceAddr) -> OffloadResult<()> {
        self.with_device(device_id, |dev| {
            let len = dst.len();
            let (buf, offset) = dev.buffer_mut(src, len)?;
            dst.copy_from_slice(&buf[offset..offset + len]);
            dev.stats.retrieves += 1;
            dev.stats.retrieved_bytes += len;
            Ok(())
        })
    }

    fn run_region(
        &self,
        device_id: i32,
        entry: usize,
        args: &[usize],
        offsets: &[isize],
    ) -> OffloadResult<()> {
        self.with_device(device_id, |dev| {
            if !dev.initialized {
                return Err(OffloadError::Backend(format!(
                    "device {device_id} launched before init"
                )));
            }
            dev.launches.push(Launch {
                entry,
                args: args.to_vec(),
                offsets: offsets.to_vec(),
            });
            dev.stats.launches += 1;
            Ok(())
        })
    }

    fn set_mode(&self, mode: OffloadMode) -> OffloadResult<()> {
        if !self.supports_mode {
            return Err(OffloadError::Unsupported("set_mode"));
        }
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| OffloadError::Backend("loopback state poisoned".into()))?;
        guard.mode = mode;
        Ok(())
    }
}
