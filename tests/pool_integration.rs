//! Black-box integration tests driving `PagePool` the way an external
//! crate would: through the public API and the `pool_malloc!`/
//! `pool_ralloc!`/`pool_free!` macros only.

#![cfg(feature = "std")]

extern crate std;

use native_page_pool::{PagePool, PoolError, TestHost};
use native_page_pool::{pool_free, pool_malloc, pool_ralloc};

#[test]
fn mixed_workload_leaves_the_pool_empty() {
    let mut pool = PagePool::init(TestHost::new()).expect("init");
    let mut live = Vec::new();

    for round in 0..200usize {
        let size = 8 + (round % 113);
        let ptr = pool_malloc!(pool, size).expect("malloc");
        unsafe { ptr.as_ptr().write_bytes((round % 256) as u8, size) };
        live.push((ptr, size));

        if round % 3 == 0 {
            if let Some((ptr, _)) = live.pop() {
                pool_free!(pool, ptr).expect("free");
            }
        }
        if round % 7 == 0 {
            if let Some((ptr, size)) = live.pop() {
                let grown = pool_ralloc!(pool, ptr, size * 2).expect("ralloc");
                live.push((grown, size * 2));
            }
        }
    }

    let still_live = live.len();
    for (ptr, _) in live {
        pool_free!(pool, ptr).expect("final free");
    }

    assert!(still_live > 0, "the workload should leave something to free at the end");
    assert_eq!(pool.host().live_allocation_count(), 0);
}

#[test]
fn stress_many_small_allocations_round_trip() {
    let mut pool = PagePool::init(TestHost::new()).expect("init");
    let mut ptrs = Vec::with_capacity(1000);

    for i in 0..1000usize {
        let ptr = pool_malloc!(pool, (i % 64) + 1).expect("malloc");
        ptrs.push(ptr);
    }

    assert_eq!(pool.host().live_allocation_count(), 1000);

    for ptr in ptrs {
        pool_free!(pool, ptr).expect("free");
    }

    assert_eq!(pool.host().live_allocation_count(), 0);
}

#[cfg(not(feature = "diagnostics"))]
#[test]
fn cross_pool_free_returns_foreign_pool_without_diagnostics() {
    let mut a = PagePool::init(TestHost::new()).expect("init a");
    let mut b = PagePool::init(TestHost::new()).expect("init b");
    let ptr = pool_malloc!(a, 16).expect("malloc");
    assert_eq!(pool_free!(b, ptr), Err(PoolError::ForeignPool));
    pool_free!(a, ptr).expect("free");
}

#[test]
fn ralloc_failure_leaves_the_original_allocation_intact() {
    let mut pool = PagePool::init(TestHost::new()).expect("init");
    let ptr = pool_malloc!(pool, 32).expect("malloc");
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0x5a, 32) };

    pool.host().fail_next_reallocation();
    let result = pool_ralloc!(pool, ptr, 4096);
    assert_eq!(result, Err(PoolError::HostAllocationFailed));

    let slice = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 32) };
    assert!(slice.iter().all(|&b| b == 0x5a));

    pool_free!(pool, ptr).expect("free after failed ralloc");
}

#[test]
fn dropping_the_pool_without_explicit_free_releases_everything() {
    let host = TestHost::new();
    {
        let mut pool = PagePool::init(host).expect("init");
        for i in 0..16 {
            pool_malloc!(pool, i + 1).expect("malloc");
        }
        // pool drops here without any explicit free/exit call.
    }
}

#[cfg(feature = "diagnostics")]
#[test]
fn dump_reports_outstanding_allocations() {
    let mut pool = PagePool::init(TestHost::new()).expect("init");
    let a = pool_malloc!(pool, 16).expect("malloc a");
    let _b = pool_malloc!(pool, 24).expect("malloc b");
    pool_free!(pool, a).expect("free a");

    let mut reported = Vec::new();
    let counters = pool.dump(|leak| reported.push(leak.size));

    assert_eq!(reported, vec![24]);
    assert_eq!(counters.malloc_count, 2);
    assert_eq!(counters.free_count, 1);
}
