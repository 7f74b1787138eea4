#![no_std]

pub mod error;
pub mod handle;
pub mod header;
pub mod host;
mod list;
pub mod pool;

#[cfg(any(test, feature = "std"))]
extern crate std;

#[cfg(all(not(test), not(feature = "std")))]
use core::panic::PanicInfo;

#[cfg(all(not(test), not(feature = "std")))]
#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {}
}

pub use error::{CorruptionKind, PoolError, PoolResult};
pub use handle::{PoolHandle, PoolKind};
pub use header::{CallSite, POOL_DATA_ALIGN, POOL_DATA_MAGIC, POOL_DATA_PATCH};
pub use host::HostMemory;
pub use pool::PagePool;

#[cfg(feature = "diagnostics")]
pub use pool::{PoolCounters, PoolReport};

#[cfg(unix)]
pub use host::LibcHost;

#[cfg(feature = "std")]
pub use host::test_host::TestHost;

/// Captures the call site of a `pool_malloc!`/`pool_ralloc!` invocation as
/// a [`CallSite`]. Not meant to be invoked directly; use the
/// `pool_malloc!`/`pool_ralloc!`/`pool_free!` macros. `CallSite` is a
/// zero-sized unit when the `diagnostics` feature is disabled, so this
/// macro (and the ones built on it) compile either way.
#[doc(hidden)]
#[macro_export]
macro_rules! __pool_call_site {
    () => {
        $crate::header::CallSite::captured(file!(), module_path!(), line!())
    };
}

/// Allocate `size` bytes from `pool`, capturing the call site for
/// diagnostics. Expands to [`pool::PagePool::malloc`].
#[macro_export]
macro_rules! pool_malloc {
    ($pool:expr, $size:expr) => {
        $pool.malloc($size, $crate::__pool_call_site!())
    };
}

/// Resize the allocation at `ptr` in `pool`, capturing the call site.
/// Expands to [`pool::PagePool::ralloc`].
#[macro_export]
macro_rules! pool_ralloc {
    ($pool:expr, $ptr:expr, $size:expr) => {
        $pool.ralloc($ptr, $size, $crate::__pool_call_site!())
    };
}

/// Free the allocation at `ptr` in `pool`. Expands to
/// [`pool::PagePool::free`].
#[macro_export]
macro_rules! pool_free {
    ($pool:expr, $ptr:expr) => {
        $pool.free($ptr)
    };
}
