//! Buffer cache behaviour under real concurrency and slow disks.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tern_kernel::bio::{BufferCache, EOF_SENTINEL};
use tern_kernel::hal::{BlockDevice, MemDisk};
use tern_kernel::param::SECTOR_SIZE;

/// With a disk whose reads stall, concurrent readers of a sector being
/// loaded must wait for it to become ready rather than observe a
/// half-initialised buffer.
#[test]
fn readers_wait_for_slow_load() {
    let disk = Arc::new(MemDisk::with_read_delay(64, Duration::from_millis(60)));
    let mut pattern = [0u8; SECTOR_SIZE];
    for (i, b) in pattern.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    disk.write_sector(5, &pattern);

    let cache = Arc::new(BufferCache::new(disk, Duration::from_secs(60)));
    let mut workers = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        workers.push(thread::spawn(move || {
            let mut buf = [0u8; SECTOR_SIZE];
            assert!(cache.read(5, EOF_SENTINEL, 0, SECTOR_SIZE, &mut buf));
            buf
        }));
    }
    for w in workers {
        let got = w.join().unwrap();
        assert_eq!(&got[..], &pattern[..]);
    }
    cache.done();
}

/// Concurrent writers to distinct sectors never corrupt each other,
/// even while eviction is churning the 64 slots.
#[test]
fn parallel_writers_distinct_sectors() {
    let disk = Arc::new(MemDisk::new(512));
    let cache = Arc::new(BufferCache::new(disk.clone(), Duration::from_secs(60)));

    let mut workers = Vec::new();
    for t in 0u8..4 {
        let cache = cache.clone();
        workers.push(thread::spawn(move || {
            for i in 0..100u32 {
                let sector = 1 + u32::from(t) * 100 + i;
                let byte = t.wrapping_mul(31).wrapping_add(i as u8);
                assert!(cache.write(sector, 0, 1, &[byte], true));
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }
    for t in 0u8..4 {
        for i in 0..100u32 {
            let sector = 1 + u32::from(t) * 100 + i;
            let mut b = [0u8; 1];
            assert!(cache.read(sector, EOF_SENTINEL, 0, 1, &mut b));
            assert_eq!(b[0], t.wrapping_mul(31).wrapping_add(i as u8));
        }
    }
    cache.done();
    assert_eq!(cache.dirty_count(), 0);
}

/// A read-ahead hint pulls the next sector into the cache without the
/// caller asking for it.
#[test]
fn read_ahead_prefetches() {
    let disk = Arc::new(MemDisk::new(64));
    let cache = BufferCache::new(disk, Duration::from_secs(60));

    let mut buf = [0u8; 4];
    assert!(cache.read(7, 8, 0, 4, &mut buf));

    // Give the daemon a moment to service the request.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if cache.resident_sectors().contains(&8) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "sector 8 never prefetched");
        thread::sleep(Duration::from_millis(10));
    }
    cache.done();
}

/// The write-behind timer flushes dirty buffers without any shutdown.
#[test]
fn write_behind_flushes_periodically() {
    let disk = Arc::new(MemDisk::new(64));
    let cache = BufferCache::new(disk.clone(), Duration::from_millis(50));

    assert!(cache.write(3, 0, 4, &[1, 2, 3, 4], true));
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if cache.dirty_count() == 0 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "never flushed");
        thread::sleep(Duration::from_millis(20));
    }
    let mut sector = [0u8; SECTOR_SIZE];
    disk.read_sector(3, &mut sector);
    assert_eq!(&sector[..4], &[1, 2, 3, 4]);
    cache.done();
}

/// Cache capacity never exceeds its limit under concurrent churn.
#[test]
fn capacity_invariant_under_churn() {
    let disk = Arc::new(MemDisk::new(1024));
    let cache = Arc::new(BufferCache::new(disk, Duration::from_secs(60)));

    let mut workers = Vec::new();
    for t in 0u32..4 {
        let cache = cache.clone();
        workers.push(thread::spawn(move || {
            let mut buf = [0u8; 1];
            for i in 0..200 {
                cache.read(1 + (t * 37 + i) % 500, EOF_SENTINEL, 0, 1, &mut buf);
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }
    assert!(cache.len() <= tern_kernel::param::NBUF);
    cache.done();
}
