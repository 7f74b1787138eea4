use core::fmt;

/// Which invariant a failed header validation tripped.
///
/// Only ever surfaces through a [`PoolError::Corrupted`] on the
/// non-aborting paths (`diagnostics` disabled) -- when `diagnostics` is
/// enabled, a failed check aborts directly instead of returning this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    /// `magic` is the bitwise-inverted sentinel: this header was already
    /// freed.
    DoubleFree,
    /// `magic` is neither the live sentinel nor its inverse: the header
    /// was never valid, or something has scribbled over it.
    InvalidMagic,
    /// The byte at `user[size]` is not `POOL_DATA_PATCH`: something wrote
    /// one byte past the end of this allocation.
    GuardUnderflow,
}

impl CorruptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CorruptionKind::DoubleFree => "data have already been freed",
            CorruptionKind::InvalidMagic => "invalid or corrupted allocation header",
            CorruptionKind::GuardUnderflow => "one-byte buffer underflow past the guard byte",
        }
    }
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced from the fallible page pool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The host memory source's allocate/reallocate call returned null.
    HostAllocationFailed,
    /// A null pointer was passed where a live allocation was expected.
    NullPointer,
    /// The pointer's header names a different pool than the one asked to
    /// free/resize it.
    ForeignPool,
    /// A non-aborting corruption check failed (see [`CorruptionKind`]).
    /// Only reachable with the `diagnostics` feature disabled; with it
    /// enabled, detected corruption aborts instead of returning this.
    Corrupted(CorruptionKind),
    /// [`crate::host::HostMemory::page_size`] reported zero.
    InvalidPageSize,
}

impl PoolError {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolError::HostAllocationFailed => "host memory source failed to satisfy the request",
            PoolError::NullPointer => "null pointer passed to a page pool operation",
            PoolError::ForeignPool => "pointer does not belong to this pool",
            PoolError::Corrupted(_) => "allocation header failed validation",
            PoolError::InvalidPageSize => "host memory source reported a page size of zero",
        }
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Corrupted(kind) => write!(f, "{}: {}", self.as_str(), kind),
            _ => f.write_str(self.as_str()),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PoolError {}

pub type PoolResult<T> = Result<T, PoolError>;
