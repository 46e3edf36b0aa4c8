use thiserror::Error;

#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend Error: {0}")]
    Backend(String),

    #[error("Out of device memory (request of {0} bytes)")]
    OutOfMemory(usize),

    #[error("Address space slice exhausted")]
    AddressSpaceExhausted,

    #[error("Range {begin:#x}..{end:#x} overlaps backed segment {seg_begin:#x}..{seg_end:#x}")]
    Overlap {
        begin: usize,
        end: usize,
        seg_begin: usize,
        seg_end: usize,
    },

    #[error("Range {begin:#x}+{size:#x} wraps past the end of the address space")]
    AddressOverflow { begin: usize, size: usize },

    #[error("Explicit extension of mapping at {0:#x} is not allowed")]
    ExplicitExtension(usize),

    #[error("Host pointer {0:#x} is already associated with a different target")]
    AssociationConflict(usize),

    #[error("Host pointer {0:#x} was not associated")]
    NotAssociated(usize),

    #[error("Host range at {0:#x} is not mapped")]
    NotMapped(usize),

    #[error("Invalid deep-copy descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("No allocation context is active")]
    NoActiveContext,

    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(i32),

    #[error("Operation not supported in {0} mode")]
    Unsupported(&'static str),

    #[error("General Error: {0}")]
    General(String),
}

// A convenient alias
pub type OffloadResult<T> = Result<T, OffloadError>;
