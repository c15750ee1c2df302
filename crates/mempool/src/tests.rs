use super::*;

#[test]
fn alloc_rounds_up_to_class() {
    let pool = MemPool::new(1024, 1 << 20);
    let buf = pool.alloc(1000);
    assert_eq!(buf.len(), 1000);
    assert_eq!(buf.capacity(), 1024);
}

#[test]
fn dropped_slab_is_recycled() {
    let pool = MemPool::new(1024, 1 << 20);
    {
        let _a = pool.alloc(512);
    }
    assert_eq!(pool.free_slabs(), 1);

    let b = pool.alloc(512);
    assert_eq!(pool.free_slabs(), 0);
    let stats = pool.stats();
    assert_eq!(stats[0].allocated, 2);
    assert_eq!(stats[0].recycled, 1);
    drop(b);
}

#[test]
fn recycled_slab_is_zeroed() {
    let pool = MemPool::new(64, 64);
    {
        let mut a = pool.alloc(64);
        a.fill(0xff);
    }
    let b = pool.alloc(64);
    assert!(b.iter().all(|&x| x == 0));
}

#[test]
fn oversized_request_uses_backstop() {
    let pool = MemPool::new(1024, 4096);
    let big = pool.alloc(1 << 20);
    assert_eq!(big.len(), 1 << 20);
    drop(big);
    // Backstop buffers do not enter a free list.
    assert_eq!(pool.free_slabs(), 0);
}

#[test]
fn classes_double_from_min_to_max() {
    let pool = MemPool::new(1024, 8192);
    let sizes: Vec<usize> = pool.stats().iter().map(|s| s.slab_size).collect();
    assert_eq!(sizes, vec![1024, 2048, 4096, 8192]);
}

#[test]
fn concurrent_alloc_and_free() {
    use std::sync::Arc;
    use std::thread;

    let pool = Arc::new(MemPool::new(1024, 1 << 16));
    let mut handles = Vec::new();
    for t in 0..4 {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || {
            for i in 0..200 {
                let mut buf = pool.alloc(1024 + (i % 3) * 1024);
                buf[0] = t as u8;
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let total: u64 = pool.stats().iter().map(|s| s.allocated).sum();
    assert_eq!(total, 800);
}
