pub mod at;
pub mod device;
pub mod io;
pub mod map;
pub mod runtime;
pub mod segment;
pub mod strategy;

pub use device::{Device, KernelArg, ShadowPointer, SuspendedUpdate};
pub use map::{AddressMap, MappingEntry, RefCount};
pub use runtime::RuntimeState;
pub use segment::{Segment, SegmentList, TableEntry};
pub use strategy::BackingStrategy;
