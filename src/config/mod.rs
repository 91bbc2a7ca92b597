//! Cache Configuration Module
//!
//! Configuration structs have public fields so they can be built with struct
//! update syntax on top of a derived default:
//!
//! | Config | Controls |
//! |--------|----------|
//! | [`ArcConfig`] | size targets, policy knobs, index geometry |
//! | [`ReclaimConfig`] | the background reclaim thread |
//! | [`SecondTierConfig`] | the secondary-device feed thread and its write sizing |
//!
//! # Sizing Guidelines
//!
//! [`ArcConfig::for_memory`] derives every size from the amount of memory the
//! cache may assume it has, the same way a kernel cache sizes itself at boot:
//!
//! ```text
//! max_size = 3/4 of memory            (memory < 4 GiB)
//!          = memory - 1 GiB           (otherwise)
//! min_size = min(max_size, 64 MiB)
//! index    = next power of two >= memory / average_block_size buckets
//! locks    = max(buckets / 512, 256), rounded to a power of two
//! ```
//!
//! # Examples
//!
//! ```
//! use block_arc::config::{ArcConfig, ReclaimConfig};
//!
//! let config = ArcConfig {
//!     reclaim: ReclaimConfig { enabled: false, ..ReclaimConfig::default() },
//!     ..ArcConfig::for_memory(512 * 1024 * 1024)
//! };
//! assert_eq!(config.max_size, 384 * 1024 * 1024);
//! assert_eq!(config.min_size, 64 * 1024 * 1024);
//! ```

pub mod arc;
pub mod reclaim;
pub mod second_tier;

pub use arc::ArcConfig;
pub use reclaim::ReclaimConfig;
pub use second_tier::SecondTierConfig;
