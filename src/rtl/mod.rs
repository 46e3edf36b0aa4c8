pub mod aperture;
pub mod loopback;

use crate::error::{OffloadError, OffloadResult};

/// Address in the CPU-visible memory space.
pub type HostAddr = usize;

/// Address in the offload device's memory space.
pub type DeviceAddr = usize;

/// Execution mode a backend may be switched into after device initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadMode {
    /// Kernels receive translated device pointers directly.
    Default,
    /// Kernels receive host pointers and translate them through the device-side table.
    AddressTranslate,
}

/// The pluggable device layer (RTL) that performs actual allocation and data movement.
///
/// Implementations must be shareable across devices and threads; every method takes `&self`
/// and does its own internal locking.
pub trait DeviceBackend: Send + Sync {
    /// Prepare a device for use. Called once per device.
    fn init_device(&self, device_id: i32) -> OffloadResult<()>;

    /// Allocate `size` bytes of device memory. `hint` is the host address the storage will
    /// mirror, when there is one. Returns `None` on exhaustion.
    fn allocate(&self, device_id: i32, size: usize, hint: Option<HostAddr>) -> Option<DeviceAddr>;

    /// Free a previous allocation.
    fn free(&self, device_id: i32, addr: DeviceAddr) -> OffloadResult<()>;

    /// Copy host bytes to device memory at `dst`.
    fn submit(&self, device_id: i32, dst: DeviceAddr, src: &[u8]) -> OffloadResult<()>;

    /// Copy device memory at `src` into `dst`.
    fn retrieve(&self, device_id: i32, dst: &mut [u8], src: DeviceAddr) -> OffloadResult<()>;

    /// Launch a compiled region with the given (already translated) arguments.
    fn run_region(
        &self,
        device_id: i32,
        entry: usize,
        args: &[usize],
        offsets: &[isize],
    ) -> OffloadResult<()>;

    /// Switch the backend's execution mode. Optional; backends without mode support
    /// keep the default implementation.
    fn set_mode(&self, _mode: OffloadMode) -> OffloadResult<()> {
        Err(OffloadError::Unsupported("set_mode"))
    }
}

pub use loopback::LoopbackBackend;
