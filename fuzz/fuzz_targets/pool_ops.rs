#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use native_page_pool::{pool_free, pool_malloc, pool_ralloc, PagePool, TestHost};

#[derive(Debug, Arbitrary)]
enum PoolOperation {
    Malloc { size: u16 },
    Ralloc { index: usize, size: u16 },
    Free { index: usize },
    FailNextAllocation,
    FailNextReallocation,
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);

    let operations: Result<Vec<PoolOperation>, _> =
        (0..200).map(|_| PoolOperation::arbitrary(&mut u)).collect();

    if let Ok(ops) = operations {
        fuzz_pool(ops);
    }
});

fn fuzz_pool(operations: Vec<PoolOperation>) {
    let host = TestHost::new();
    let mut pool = PagePool::init(host).expect("TestHost::init never fails");
    let mut live: Vec<(core::ptr::NonNull<u8>, usize)> = Vec::new();

    for op in operations {
        match op {
            PoolOperation::Malloc { size } => {
                let size = (size as usize % 4096) + 1;
                if let Ok(ptr) = pool_malloc!(pool, size) {
                    unsafe { ptr.as_ptr().write_bytes(0xAB, size) };
                    live.push((ptr, size));
                    if live.len() > 256 {
                        let (ptr, _) = live.remove(0);
                        pool_free!(pool, ptr).expect("free a tracked allocation");
                    }
                }
            }
            PoolOperation::Ralloc { index, size } => {
                if !live.is_empty() {
                    let index = index % live.len();
                    let (ptr, _) = live.remove(index);
                    let size = (size as usize % 4096) + 1;
                    match pool_ralloc!(pool, ptr, size) {
                        Ok(grown) => live.push((grown, size)),
                        Err(_) => {
                            // Restartable failure: the original pointer is
                            // still valid and still tracked by the pool.
                            live.push((ptr, size));
                        }
                    }
                }
            }
            PoolOperation::Free { index } => {
                if !live.is_empty() {
                    let index = index % live.len();
                    let (ptr, _) = live.remove(index);
                    pool_free!(pool, ptr).expect("free a tracked allocation");
                }
            }
            PoolOperation::FailNextAllocation => {
                pool.host().fail_next_allocation();
            }
            PoolOperation::FailNextReallocation => {
                pool.host().fail_next_reallocation();
            }
        }
    }

    for (ptr, _) in live {
        pool_free!(pool, ptr).expect("final cleanup free");
    }

    assert_eq!(pool.host().live_allocation_count(), 0);
}
