//! Host/device address translation for offloaded regions: an interval map of mapped host
//! ranges, bulk segments with a device translation table, a device-shadow allocator, and
//! deep copies of pointer-carrying structures.

pub mod config;
pub mod error;
pub mod mm;
pub mod omptarget;
pub mod perf;
pub mod rtl;
pub mod rtt;
pub mod utils;

pub use config::{Config, MappingMode};
pub use error::{OffloadError, OffloadResult};
pub use omptarget::{Device, RuntimeState};
pub use rtl::{DeviceAddr, DeviceBackend, HostAddr, LoopbackBackend};
