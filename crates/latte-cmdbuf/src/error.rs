use thiserror::Error;

use crate::host::CORE_COUNT;
use crate::ring::MIN_LEASE_WORDS;

/// Structural problems with a [`PoolConfig`](crate::PoolConfig).
///
/// Everything else the pool checks at runtime is a protocol violation and
/// panics; see the crate docs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolConfigError {
    #[error("command buffer pool region is empty")]
    EmptyRegion,

    #[error(
        "command buffer pool region of {size_words:#x} words cannot hold one \
         {MIN_LEASE_WORDS:#x} word lease"
    )]
    RegionTooSmall { size_words: u32 },

    #[error("pool region [{base:#x}, {base:#x} + {size_words:#x}) overflows the word address space")]
    RegionOverflow { base: u32, size_words: u32 },

    #[error("main graphics core {core} out of range (core count {CORE_COUNT})")]
    MainCoreOutOfRange { core: u32 },
}
