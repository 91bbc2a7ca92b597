//! Block identity.
//!
//! Every cached block is keyed by the triple that makes its content immutable:
//! the pool it belongs to, the 128-bit device address it was written at, and
//! the generation (transaction group) in which it was born. Two blocks with the
//! same identity always carry the same bytes, which is what allows the cache
//! to share one buffer between all readers.
//!
//! The all-zero location with a zero birth is reserved: it names no block and
//! is used both for anonymous (not yet written) data and for holes.

use core::fmt;

/// Immutable identity of a cached block.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    /// Pool the block belongs to.
    pub pool: u64,
    /// 128-bit device address, stored as two words.
    pub location: [u64; 2],
    /// Generation the block was written in.
    pub birth: u64,
}

impl BlockId {
    /// The anonymous non-identity.
    pub const ANONYMOUS: BlockId = BlockId {
        pool: 0,
        location: [0, 0],
        birth: 0,
    };

    /// Creates an identity from its parts.
    pub const fn new(pool: u64, location: u128, birth: u64) -> Self {
        BlockId {
            pool,
            location: [(location >> 64) as u64, location as u64],
            birth,
        }
    }

    /// Returns the location as a single 128-bit value.
    pub const fn location(&self) -> u128 {
        ((self.location[0] as u128) << 64) | self.location[1] as u128
    }

    /// True when this identity names no block.
    ///
    /// The pool id is ignored: a hole or an unwritten block of any pool is
    /// anonymous.
    pub const fn is_anonymous(&self) -> bool {
        self.location[0] == 0 && self.location[1] == 0 && self.birth == 0
    }

    /// Returns the same location and birth bound to another pool.
    pub const fn with_pool(self, pool: u64) -> Self {
        BlockId { pool, ..self }
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockId({}:{:016x}{:016x}@{})",
            self.pool, self.location[0], self.location[1], self.birth
        )
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:x}@{}", self.pool, self.location(), self.birth)
    }
}
