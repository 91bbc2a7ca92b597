#![doc = include_str!("../README.md")]
//!
//! ---
//!
//! # Code Reference
//!
//! ## Replacement in one picture
//!
//! ```text
//!          ◀──────────────── target c ────────────────▶
//!          ◀──── p ────▶
//!  ┌──────────────┬──────────┬────────────┬────────────────┐
//!  │ Recent-Ghost │  Recent  │  Frequent  │ Frequent-Ghost │
//!  └──────────────┴──────────┴────────────┴────────────────┘
//!     history        data        data         history
//! ```
//!
//! A miss that lands on a Recent-Ghost entry means Recent was too small: `p`
//! grows. A miss on a Frequent-Ghost entry shrinks it. Eviction takes from
//! whichever live state is over its share.
//!
//! ## Reading and writing
//!
//! ```rust
//! use std::sync::Arc;
//! use block_arc::config::ArcConfig;
//! use block_arc::io::{MemoryBlockIo, Priority};
//! use block_arc::{BlockCache, BlockId, ReadOptions, Residency, StateKind};
//!
//! let io = Arc::new(MemoryBlockIo::new());
//! let cache = BlockCache::init(ArcConfig::for_blocks(64, 16), io.clone()).unwrap();
//!
//! // Fill private data and write it out
//! let scratch = cache.alloc_reference(16, false).unwrap();
//! scratch.data_mut().unwrap().copy_from_slice(&[9; 16]);
//! let id = cache.write(BlockId::new(3, 0, 0), &scratch, Priority::Sync).unwrap();
//!
//! // The written block is now cached and shared
//! assert_eq!(cache.probe(&id), Residency::Live(StateKind::Recent));
//! let again = cache.read(id, 16, ReadOptions::default()).unwrap();
//! assert!(again.cached());
//! assert_eq!(io.reads(), 0);
//! ```
//!
//! ## Modules
//!
//! - [`config`]: sizing and policy knobs
//! - [`io`]: the physical layer and secondary device interfaces, with
//!   in-memory implementations
//! - [`metrics`]: counters and the [`CacheMetrics`](metrics::CacheMetrics)
//!   reporting trait

mod adapt;
mod arc;
mod buf;
mod cache;
mod error;
mod evict;
mod identity;
mod index;
mod l2;
mod reclaim;
mod reference;
mod state;
mod throttle;

/// Slot arena backing the eviction lists.
///
/// Internal infrastructure; links are plain indices so a buffer can carry its
/// own position without any raw pointers.
pub(crate) mod list;

/// Cache configuration structures.
pub mod config;

/// Collaborator interfaces for the physical layer and secondary devices.
pub mod io;

/// Cache metrics system.
pub mod metrics;

pub use cache::{BlockCache, CacheSizes, Find, ReadOptions, ReadOutcome, ReadSource, Residency};
pub use error::{CacheError, ReserveError, Result};
pub use identity::BlockId;
pub use reclaim::{ManualPressure, MemoryPressure, NoPressure, ReclaimHook, ReclaimStrategy, SampledPressure};
pub use reference::{EvictHandler, Reference};
pub use state::StateKind;
