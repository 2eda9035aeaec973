//! Typheus Memory - region, arena and free-list heap allocators
//!
//! The engine's memory layer. Every allocator owns one contiguous
//! [`Region`] of OS pages and hands out raw bytes from it:
//! - [`ArenaAllocator`]: bump allocation, released in bulk (reset, pop, checkpoints)
//! - [`HeapAllocator`]: variable-size alloc/free/realloc over an address-ordered
//!   free list with coalescing, first-fit or best-fit
//! - [`context`]: a per-thread "active allocator" for code that allocates
//!   without being handed an allocator
//!
//! Failures are fatal through the plain entry points and recoverable through
//! the `try_` variants, which return [`AllocationError`].

pub mod arena;
pub mod config;
pub mod context;
pub mod error;
pub mod heap;
pub mod logging;
pub mod region;

// Re-export core types
pub use arena::{ArenaAllocator, Checkpoint};
pub use config::{ConfigError, MemoryConfig};
pub use context::{Allocator, AllocatorKind, ContextGuard};
pub use error::{AllocationError, Result};
pub use heap::{BlockInfo, BlockState, FitStrategy, HeapAllocator, HeapStats};
pub use region::{gib, kib, mib, Region};
