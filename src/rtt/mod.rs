//! Runtime type descriptors and the deep-copy traversal they drive.

pub mod cursor;
pub mod program;
pub mod types;

pub use cursor::{PointerSource, RawMemory, Region, RegionKind, RootArgument, RttCursor, Step};
pub use program::{ProgramCache, RttProgram};
pub use types::{MapType, RttCode, TypeDescriptor};
