//! # subheap-core
//!
//! Sub-allocating heap manager for graphics memory.
//!
//! A [`GpuHeap`] acquires a small number of large native blocks from a
//! [`BlockProvider`] and subdivides them with a segregated-fit scheme:
//! bitmap pages for byte-granular requests, region runs carved from
//! shared blocks for mid-size requests, dedicated blocks for the rest.
//! All bookkeeping lives in a fixed-capacity arena of page records;
//! allocations are identified by one-word [`HeapHandle`] values. No
//! `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod handle;
pub mod heap;
pub mod provider;

mod arena;
mod bins;
mod list;

pub use config::HeapConfig;
pub use error::{AllocError, ConfigError};
pub use handle::{HeapHandle, MAX_MEMORY_TYPES, MemoryTypeId, PageKind};
pub use heap::{AllocationView, GpuHeap, TypeSummary};
pub use provider::{BlockId, BlockProvider, MAX_BLOCK_ID};
