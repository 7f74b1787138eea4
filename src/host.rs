//! The host memory source: raw allocate/reallocate/free of uninterpreted
//! byte regions, plus the system page size. Kept external to the pool
//! itself -- the pool only ever calls through this trait, never a global
//! allocator directly, so it stays usable in `no_std` binaries that have
//! no `#[global_allocator]` at all.

use core::ptr::NonNull;

/// A source of raw memory the page pool carves allocations out of.
///
/// Implementations are trusted: `allocate`/`reallocate` either return a
/// `size`-byte region or `None`, and `free` releases exactly what a prior
/// `allocate`/`reallocate` call on `self` returned. The pool does not
/// track sizes on the host's behalf, so an implementation whose
/// `free`/`reallocate` need the original size (as `std::alloc::System`
/// does) must record it itself -- see [`test_host::TestHost`].
pub trait HostMemory {
    /// Allocate an uninitialized, at-least-two-byte-aligned region of
    /// `size` bytes. Returns `None` on failure.
    ///
    /// # Safety
    /// `size` must be nonzero.
    unsafe fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Resize the region at `ptr` (previously returned by `allocate` or
    /// `reallocate` on `self`) to `size` bytes, possibly moving it.
    /// Returns `None` on failure, in which case `ptr` remains valid and
    /// unchanged.
    ///
    /// # Safety
    /// `ptr` must be a region currently live on `self`; `size` must be
    /// nonzero.
    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>>;

    /// Release the region at `ptr`, previously returned by `allocate` or
    /// `reallocate` on `self`.
    ///
    /// # Safety
    /// `ptr` must be a region currently live on `self`, and must not be
    /// used again afterward.
    unsafe fn free(&self, ptr: NonNull<u8>);

    /// The host's page size in bytes, queried once at pool `init`. A
    /// return of `0` means the host could not determine it, which
    /// `PagePool::init` treats as a hard init failure.
    fn page_size(&self) -> usize;
}

/// Default host backed directly by the C allocator (`malloc`/`realloc`/
/// `free`/`sysconf`), available on every `unix` target. This is the
/// natural home for the `libc` dependency the crate already carries.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHost;

#[cfg(unix)]
impl HostMemory for LibcHost {
    unsafe fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = unsafe { libc::malloc(size) } as *mut u8;
        NonNull::new(ptr)
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        let new_ptr = unsafe { libc::realloc(ptr.as_ptr() as *mut libc::c_void, size) } as *mut u8;
        NonNull::new(new_ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        unsafe { libc::free(ptr.as_ptr() as *mut libc::c_void) };
    }

    fn page_size(&self) -> usize {
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n > 0 {
            n as usize
        } else {
            0
        }
    }
}

/// A `std`-only host for tests and fuzzing, built on `std::alloc` rather
/// than `libc` so it runs the same way on every CI host regardless of
/// platform, and so it can be told to fail its next call on demand --
/// the hook the ralloc-restart property test needs, since `libc`'s
/// allocator can't be forced to fail deterministically.
#[cfg(feature = "std")]
pub mod test_host {
    use super::HostMemory;
    use crate::header::POOL_DATA_ALIGN;
    use core::cell::{Cell, RefCell};
    use core::ptr::NonNull;
    use std::alloc::{alloc, dealloc, realloc, Layout};
    use std::collections::HashMap;

    /// `std::alloc`-backed [`HostMemory`] that records the `Layout` of
    /// every live allocation (needed because `std::alloc::System`
    /// requires the exact original layout back on `dealloc`/`realloc`,
    /// unlike `free`/`realloc` in libc) and can be armed to fail its next
    /// allocation or reallocation. Single-owner, like the pool itself --
    /// no internal locking.
    pub struct TestHost {
        layouts: RefCell<HashMap<usize, Layout>>,
        fail_next_allocation: Cell<bool>,
        fail_next_reallocation: Cell<bool>,
        page_size: usize,
    }

    impl TestHost {
        pub fn new() -> Self {
            Self {
                layouts: RefCell::new(HashMap::new()),
                fail_next_allocation: Cell::new(false),
                fail_next_reallocation: Cell::new(false),
                page_size: 4096,
            }
        }

        /// The next call to `allocate` returns `None` instead of
        /// allocating.
        pub fn fail_next_allocation(&self) {
            self.fail_next_allocation.set(true);
        }

        /// The next call to `reallocate` returns `None` instead of
        /// resizing, leaving the original block untouched -- this is
        /// what exercises `PagePool::ralloc`'s restartable-failure path.
        pub fn fail_next_reallocation(&self) {
            self.fail_next_reallocation.set(true);
        }

        /// Number of allocations this host currently believes are live.
        /// Used by tests to assert the pool released everything it
        /// claimed to.
        pub fn live_allocation_count(&self) -> usize {
            self.layouts.borrow().len()
        }
    }

    impl Default for TestHost {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HostMemory for TestHost {
        unsafe fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
            if self.fail_next_allocation.replace(false) {
                return None;
            }
            let layout = Layout::from_size_align(size, POOL_DATA_ALIGN).ok()?;
            let ptr = NonNull::new(unsafe { alloc(layout) })?;
            self.layouts.borrow_mut().insert(ptr.as_ptr() as usize, layout);
            Some(ptr)
        }

        unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
            if self.fail_next_reallocation.replace(false) {
                return None;
            }
            let key = ptr.as_ptr() as usize;
            let old_layout = *self.layouts.borrow().get(&key)?;
            let new_ptr = NonNull::new(unsafe { realloc(ptr.as_ptr(), old_layout, size) })?;
            let new_layout = Layout::from_size_align(size, POOL_DATA_ALIGN).ok()?;
            let mut layouts = self.layouts.borrow_mut();
            layouts.remove(&key);
            layouts.insert(new_ptr.as_ptr() as usize, new_layout);
            Some(new_ptr)
        }

        unsafe fn free(&self, ptr: NonNull<u8>) {
            let key = ptr.as_ptr() as usize;
            if let Some(layout) = self.layouts.borrow_mut().remove(&key) {
                unsafe { dealloc(ptr.as_ptr(), layout) };
            }
        }

        fn page_size(&self) -> usize {
            self.page_size
        }
    }
}
