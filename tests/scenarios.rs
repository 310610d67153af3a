//! End-to-end allocator scenarios, each against a fresh `BitmapAllocator`
//! instance so tests can run concurrently without sharing page state.

use bmalloc::bitmap_allocator::BitmapAllocator;
use bmalloc::{Allocator, UNIT_SIZE};

fn fresh() -> BitmapAllocator {
    let _ = env_logger::builder().is_test(true).try_init();
    let a = BitmapAllocator::new();
    a.init();
    a
}

/// Allocate then release a single small block.
#[test]
fn small_cycle() {
    let allocator = fresh();

    let mut addr = allocator.allocate(48, true);
    assert!(addr.is_some());
    let ptr = addr.unwrap().as_ptr() as usize;
    assert_eq!(ptr % UNIT_SIZE, 0);
    assert_ne!(ptr % allocator_page_size(), 0, "a small block must not be page-aligned");
    assert_eq!(allocator.blocks_allocated(), 1);
    assert_eq!(allocator.num_bm_pages(), 1);

    allocator.release(&mut addr, 48).unwrap();
    assert!(addr.is_none());
    assert_eq!(allocator.blocks_allocated(), 0);
    assert_eq!(allocator.num_bm_pages(), 0);
}

/// Allocate 10 one-unit blocks on a fresh page, release them in reverse
/// order, and confirm the page ends fully unmapped.
#[test]
fn bucket_migration() {
    let allocator = fresh();

    let mut addrs = Vec::new();
    for _ in 0..10 {
        let addr = allocator.allocate(16, false);
        assert!(addr.is_some());
        addrs.push(addr);
    }
    assert_eq!(allocator.num_bm_pages(), 1);
    assert_eq!(allocator.blocks_allocated(), 10);

    for mut addr in addrs.into_iter().rev() {
        allocator.release(&mut addr, 16).unwrap();
    }
    assert_eq!(allocator.blocks_allocated(), 0);
    assert_eq!(allocator.num_bm_pages(), 0);
}

/// A block bigger than a page's data area goes straight to the OS.
#[test]
fn large_path() {
    let allocator = fresh();

    let mut addr = allocator.allocate(8192, false);
    assert!(addr.is_some());
    assert_eq!(addr.unwrap().as_ptr() as usize % allocator_page_size(), 0);
    assert_eq!(allocator.blocks_allocated(), 1);
    assert_eq!(allocator.num_bm_pages(), 0);

    allocator.release(&mut addr, 8192).unwrap();
    assert_eq!(allocator.blocks_allocated(), 0);
    assert_eq!(allocator.num_bm_pages(), 0);
}

/// Growing a small block into the large path preserves content and zeroes
/// the new tail when requested.
#[test]
fn small_to_large_grow() {
    let allocator = fresh();

    let mut addr = allocator.allocate(64, true).unwrap();
    let pattern: Vec<u8> = (0..64).collect();
    unsafe {
        std::ptr::copy_nonoverlapping(pattern.as_ptr(), addr.as_ptr(), 64);
    }
    let mut addr_opt = Some(addr);
    let changed = allocator.reallocate(&mut addr_opt, 64, 8192, true).unwrap();
    assert!(changed);
    let new_addr = addr_opt.unwrap();
    assert_eq!(new_addr.as_ptr() as usize % allocator_page_size(), 0);

    let bytes = unsafe { std::slice::from_raw_parts(new_addr.as_ptr(), 8192) };
    assert_eq!(&bytes[..64], &pattern[..]);
    assert!(bytes[64..].iter().all(|&b| b == 0));

    allocator.release(&mut addr_opt, 8192).unwrap();
}

/// In-place small grow reclaims a just-freed neighboring unit.
#[test]
fn in_place_small_grow() {
    let allocator = fresh();

    let mut a = allocator.allocate(16, false).unwrap();
    let mut b = allocator.allocate(16, false);
    unsafe {
        std::ptr::write_bytes(a.as_ptr(), 0xCD, 16);
    }

    allocator.release(&mut b, 16).unwrap();

    let mut addr_opt = Some(a);
    let changed = allocator.reallocate(&mut addr_opt, 16, 32, false).unwrap();
    assert!(!changed, "grow should succeed in place");
    assert_eq!(addr_opt.unwrap(), a);

    let bytes = unsafe { std::slice::from_raw_parts(a.as_ptr(), 16) };
    assert!(bytes.iter().all(|&b| b == 0xCD));

    allocator.release(&mut addr_opt, 32).unwrap();
    let _ = &mut a;
}

/// Reallocating within the same unit class never changes the address.
#[test]
fn reallocate_same_unit_class_keeps_address() {
    let allocator = fresh();

    let mut addr_opt = allocator.allocate(20, false).map(Some).unwrap();
    let original = addr_opt.unwrap();
    // 20 and 30 bytes both round up to 2 units at UNIT_SIZE=16.
    let changed = allocator.reallocate(&mut addr_opt, 20, 30, false).unwrap();
    assert!(!changed);
    assert_eq!(addr_opt.unwrap(), original);

    allocator.release(&mut addr_opt, 30).unwrap();
}

fn allocator_page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Many threads hammering the same allocator concurrently must still leave
/// it in a leak-free state: distinct pages get mutated by distinct threads,
/// and the superblock mutex serializes only the bucket bookkeeping.
#[test]
fn concurrent_allocate_release_leaves_no_leaks() {
    use std::sync::Arc;
    use std::thread;

    let allocator = Arc::new(fresh());
    const THREADS: usize = 4;
    const ROUNDS: usize = 256;

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || {
                let size = 16 * (i + 1);
                for _ in 0..ROUNDS {
                    let raw = allocator.allocate(size, true).expect("allocation failed");
                    unsafe {
                        std::ptr::write_bytes(raw.as_ptr(), i as u8, size);
                    }
                    let mut addr = Some(raw);
                    allocator.release(&mut addr, size).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(allocator.blocks_allocated(), 0);
    assert_eq!(allocator.num_bm_pages(), 0);
}
