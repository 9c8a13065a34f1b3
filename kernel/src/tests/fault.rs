//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 测试：缺页处理与钉住缓存的并发

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{va, Fixture};
use crate::config::SHARE_MIN_PAGE_SIZE;
use crate::errno::SptError;
use crate::mm::anon::BackingStore;
use crate::mm::hat::Prot;
use crate::mm::page::{btop, PAGE_SIZE};
use crate::mm::spt::{FaultKind, LockOp, PinArray, SegMode, SegRw, SegmentConfig, SharedSegment};

const GRANULE: usize = SHARE_MIN_PAGE_SIZE;

/// 根页可见的组必须完整可见
fn assert_whole_groups(ppa: &PinArray) {
    for i in 0..ppa.len() {
        let page = match ppa.get(i) {
            Some(page) => page,
            None => continue,
        };
        let root = page.root_index();
        if ppa.get(root).is_none() {
            continue;
        }
        for j in root..root + page.szc().pagecnt() {
            assert!(ppa.get(j).is_some(), "page {} missing from group at {}", j, root);
        }
        assert!(ppa.group(i).is_some());
    }
}

#[test]
fn test_softlock_softunlock() {
    let fx = Fixture::new(4096);
    let seg = fx.segment(2 * SHARE_MIN_PAGE_SIZE, SegMode::Dism);
    let att = fx.attach(&seg, 10);
    let group = btop(SHARE_MIN_PAGE_SIZE);

    // 请求一页，按首选页大小对齐
    att.fault(va(1), PAGE_SIZE, FaultKind::SoftLock, SegRw::Write).unwrap();
    assert_eq!(att.softlock_count(), group as isize);
    assert_eq!(fx.hat.locked_pages(seg.seg_as()), group);
    let page = fx.store.lookup(seg.amp(), 0).unwrap();
    assert!(page.is_pinned());

    att.fault(va(1), PAGE_SIZE, FaultKind::SoftUnlock, SegRw::Write).unwrap();
    assert_eq!(att.softlock_count(), 0);
    assert_eq!(fx.hat.locked_pages(seg.seg_as()), 0);
    assert!(!page.is_pinned());
    assert!(page.is_dirty());
    // 映射保留
    assert_eq!(fx.hat.mapped_pages(seg.seg_as()), group);
}

#[test]
fn test_invalidate_loads_without_pin() {
    let fx = Fixture::new(4096);
    let seg = fx.segment(2 * SHARE_MIN_PAGE_SIZE, SegMode::Dism);
    let att = fx.attach(&seg, 10);

    // 超出段的部分被截断
    att.fault(va(0), 4 * seg.realsize(), FaultKind::Invalidate, SegRw::Read).unwrap();
    assert_eq!(fx.hat.mapped_pages(seg.seg_as()), seg.npages());
    assert_eq!(fx.hat.locked_pages(seg.seg_as()), 0);
    assert_eq!(att.softlock_count(), 0);
    assert!((0..seg.npages())
        .filter_map(|i| fx.store.lookup(seg.amp(), i))
        .all(|p| !p.is_pinned()));
}

#[test]
fn test_exec_needs_exec_prot() {
    let fx = Fixture::new(4096);
    let seg = fx.segment(SHARE_MIN_PAGE_SIZE, SegMode::Dism);
    let att = fx.attach(&seg, 10);
    assert_eq!(
        att.fault(va(0), PAGE_SIZE, FaultKind::SoftLock, SegRw::Exec),
        Err(SptError::NotMapped)
    );
    assert_eq!(att.softlock_count(), 0);
    att.fault(va(0), PAGE_SIZE, FaultKind::ProtectionCheck, SegRw::Exec).unwrap();

    let config = SegmentConfig::new(SHARE_MIN_PAGE_SIZE, SegMode::Dism)
        .with_prot(Prot::READ | Prot::EXEC | Prot::USER);
    let text = SharedSegment::create(&fx.ctx, config).unwrap();
    let att = fx.attach(&text, 11);
    att.fault(va(0), PAGE_SIZE, FaultKind::Invalidate, SegRw::Exec).unwrap();
}

#[test]
fn test_osm_fault_needs_lock() {
    let fx = Fixture::new(4096);
    let seg = fx.segment(2 * GRANULE, SegMode::Osm { granule: GRANULE });
    let att = fx.attach(&seg, 10);

    assert_eq!(
        att.fault(va(0), PAGE_SIZE, FaultKind::Invalidate, SegRw::Read),
        Err(SptError::NotMapped)
    );
    att.lockop(va(0), GRANULE, LockOp::LockGranule, None, 0).unwrap();
    att.fault(va(0), PAGE_SIZE, FaultKind::SoftLock, SegRw::Read).unwrap();
    // 第二个粒度仍未锁定
    assert_eq!(
        att.fault(va(btop(GRANULE)), PAGE_SIZE, FaultKind::SoftLock, SegRw::Read),
        Err(SptError::NotMapped)
    );
    att.fault(va(0), PAGE_SIZE, FaultKind::SoftUnlock, SegRw::Read).unwrap();
    assert_eq!(att.softlock_count(), 0);
}

#[test]
fn test_softlock_nomem_releases_count() {
    let fx = Fixture::new(btop(SHARE_MIN_PAGE_SIZE));
    let seg = fx.segment(2 * SHARE_MIN_PAGE_SIZE, SegMode::Dism);
    let att = fx.attach(&seg, 10);

    assert_eq!(
        att.fault(va(0), seg.realsize(), FaultKind::SoftLock, SegRw::Read),
        Err(SptError::ResourceExhausted)
    );
    assert_eq!(att.softlock_count(), 0);
    assert_eq!(fx.hat.locked_pages(seg.seg_as()), 0);
}

/// 粒度锁定/解锁与 pagelock、Invalidate、purge 并发，
/// 读者永远看不到半发布的大页组
#[test]
fn test_pagelock_races_granule_ops() {
    let fx = Fixture::threaded(4096);
    let seg = fx.segment(4 * GRANULE, SegMode::Osm { granule: GRANULE });
    let locker = fx.attach(&seg, 10);
    let reader = fx.attach(&seg, 11);
    let prober = fx.attach(&seg, 12);
    let avail = fx.store.availrmem();
    let g = btop(GRANULE);

    locker.lockop(va(0), GRANULE, LockOp::LockGranule, None, 0).unwrap();

    let stop = AtomicBool::new(false);
    let scanned = AtomicUsize::new(0);
    std::thread::scope(|s| {
        s.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                match reader.pagelock(va(0), GRANULE, SegRw::Read) {
                    Ok(handle) => {
                        assert_whole_groups(handle.array());
                        scanned.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => assert_eq!(err, SptError::Unsupported),
                }
                reader.fault(va(0), PAGE_SIZE, FaultKind::SoftLock, SegRw::Read).unwrap();
                reader.fault(va(0), PAGE_SIZE, FaultKind::SoftUnlock, SegRw::Read).unwrap();
            }
        });
        s.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                prober.fault(va(0), GRANULE, FaultKind::Invalidate, SegRw::Read).unwrap();
                seg.purge();
            }
        });
        s.spawn(|| {
            for round in 0..32 {
                let at = va(g * (1 + round % 3));
                locker.lockop(at, GRANULE, LockOp::LockGranule, None, 0).unwrap();
                std::thread::yield_now();
                locker.lockop(at, GRANULE, LockOp::UnlockGranule, None, 0).unwrap();
            }
            stop.store(true, Ordering::Release);
        });
    });
    log::debug!("scanned {} pin arrays", scanned.load(Ordering::Relaxed));

    seg.purge();
    assert_eq!(reader.softlock_count(), 0);
    assert_eq!(prober.softlock_count(), 0);
    assert_eq!(fx.ledger.usage(seg.project()), GRANULE);
    locker.lockop(va(0), GRANULE, LockOp::UnlockGranule, None, 0).unwrap();
    assert_eq!(fx.ledger.usage(seg.project()), 0);
    assert_eq!(fx.store.availrmem(), avail);
    assert_eq!(seg.allocated(), 0);
}
