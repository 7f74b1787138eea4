//! Manual timing benchmarks, run as a plain binary (`harness = false` in
//! `Cargo.toml`) rather than through `criterion` or the unstable
//! `#[bench]` attribute.

use native_page_pool::{pool_free, pool_malloc, pool_ralloc, PagePool, TestHost};
use std::time::Instant;

fn bench_malloc_free(count: usize, size: usize) {
    let mut pool = PagePool::init(TestHost::new()).expect("init");

    let start = Instant::now();
    for _ in 0..count {
        let ptr = pool_malloc!(pool, size).expect("malloc");
        pool_free!(pool, ptr).expect("free");
    }
    let elapsed = start.elapsed();

    println!(
        "malloc+free x{count} ({size} bytes each): {elapsed:?} total, {:?} per pair",
        elapsed / count as u32
    );
}

fn bench_sustained_occupancy(count: usize, size: usize) {
    let mut pool = PagePool::init(TestHost::new()).expect("init");
    let mut live = Vec::with_capacity(count);

    let start = Instant::now();
    for _ in 0..count {
        live.push(pool_malloc!(pool, size).expect("malloc"));
    }
    let alloc_elapsed = start.elapsed();

    let start = Instant::now();
    for ptr in live {
        pool_free!(pool, ptr).expect("free");
    }
    let free_elapsed = start.elapsed();

    println!(
        "sustained x{count} ({size} bytes each): alloc {alloc_elapsed:?}, free {free_elapsed:?}"
    );
}

fn bench_ralloc_growth(count: usize) {
    let mut pool = PagePool::init(TestHost::new()).expect("init");

    let start = Instant::now();
    for _ in 0..count {
        let mut ptr = pool_malloc!(pool, 16).expect("malloc");
        for size in [64usize, 256, 1024, 4096] {
            ptr = pool_ralloc!(pool, ptr, size).expect("ralloc");
        }
        pool_free!(pool, ptr).expect("free");
    }
    let elapsed = start.elapsed();

    println!(
        "malloc + 4x ralloc + free x{count}: {elapsed:?} total, {:?} per chain",
        elapsed / count as u32
    );
}

fn main() {
    println!("\n=== native-page-pool benchmarks ===\n");

    println!("-- malloc/free pairs --");
    for size in [16, 256, 4096] {
        bench_malloc_free(50_000, size);
    }

    println!("\n-- sustained occupancy --");
    for size in [16, 256] {
        bench_sustained_occupancy(20_000, size);
    }

    println!("\n-- ralloc growth chains --");
    bench_ralloc_growth(10_000);
}
