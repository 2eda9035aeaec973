//! Allocation errors and the fail-fast path
//!
//! Every fallible operation has a `try_` form returning [`AllocationError`].
//! The plain forms route failures through [`fatal`], which logs and panics;
//! release builds abort on panic, so exhaustion and misuse terminate the
//! process with a diagnostic.

use std::fmt;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, AllocationError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// No block (or not enough arena space) for the request
    OutOfMemory { requested: usize, available: usize },
    /// A region or allocator was requested with zero bytes
    ZeroCapacity,
    /// The operating system refused the reservation
    RegionUnavailable { capacity: usize },
    /// Alignment is zero or not a power of two
    InvalidAlignment(usize),
    /// `size_of::<T>() * count` (or an alignment round-up) overflowed
    SizeOverflow,
    /// Arena pop larger than the current offset
    InvalidPop { size: usize, offset: usize },
    /// Arena restore to a checkpoint ahead of the current offset
    InvalidRestore { saved: usize, offset: usize },
    /// Pointer was never returned by this allocator
    InvalidPointer { address: usize },
    /// Pointer refers to a block that is already free
    DoubleFree { address: usize },
    /// Pointer refers to a freed block and was used as if live
    UseAfterFree { address: usize },
    /// Generic dispatch with no active allocator
    InvalidContext,
    /// The active allocator does not implement the operation
    Unsupported {
        operation: &'static str,
        allocator: &'static str,
    },
    /// Heap bookkeeping failed an integrity check
    Corrupted(String),
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested, available } => {
                write!(
                    f,
                    "Out of memory: requested {} bytes, {} bytes available",
                    requested, available
                )
            }
            Self::ZeroCapacity => write!(f, "Allocator capacity must be greater than zero"),
            Self::RegionUnavailable { capacity } => {
                write!(f, "Operating system refused a region of {} bytes", capacity)
            }
            Self::InvalidAlignment(alignment) => {
                write!(f, "Invalid alignment {}: must be a non-zero power of two", alignment)
            }
            Self::SizeOverflow => write!(f, "Allocation size overflowed"),
            Self::InvalidPop { size, offset } => {
                write!(f, "Cannot pop {} bytes from arena at offset {}", size, offset)
            }
            Self::InvalidRestore { saved, offset } => {
                write!(
                    f,
                    "Cannot restore arena forward: checkpoint {} is past offset {}",
                    saved, offset
                )
            }
            Self::InvalidPointer { address } => {
                write!(f, "Pointer {:#x} was not allocated by this heap", address)
            }
            Self::DoubleFree { address } => {
                write!(f, "Double free of pointer {:#x}", address)
            }
            Self::UseAfterFree { address } => {
                write!(f, "Use after free of pointer {:#x}", address)
            }
            Self::InvalidContext => write!(f, "No allocator is active in the allocation context"),
            Self::Unsupported { operation, allocator } => {
                write!(f, "Operation '{}' is not supported by the {} allocator", operation, allocator)
            }
            Self::Corrupted(reason) => write!(f, "Heap corrupted: {}", reason),
        }
    }
}

impl std::error::Error for AllocationError {}

impl AllocationError {
    /// Whether a caller could reasonably recover (evict and retry)
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::RegionUnavailable { .. })
    }
}

/// Terminate on an unrecoverable allocator error.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fatal(error: AllocationError) -> ! {
    tracing::error!(event = "allocator_fatal", error = %error, "Fatal allocator error");
    panic!("{}", error)
}

/// Unwrap an allocator result or terminate.
#[inline]
#[track_caller]
pub(crate) fn or_fatal<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => fatal(error),
    }
}
