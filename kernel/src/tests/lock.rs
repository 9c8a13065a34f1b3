//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 测试：DISM / OSM 锁定

use std::vec::Vec;

use super::{va, Fixture, BASE};
use crate::config::SHARE_MIN_PAGE_SIZE;
use crate::errno::SptError;
use crate::mm::anon::BackingStore;
use crate::mm::hat::AsId;
use crate::mm::page::{btop, ptob, VirtAddr, PAGE_SIZE};
use crate::mm::rctl::ProjectId;
use crate::mm::spt::{Attachment, LockOp, SegMode};

const GRANULE: usize = SHARE_MIN_PAGE_SIZE;

#[test]
fn test_lock_twice_unlock_twice_restores_baseline() {
    let fx = Fixture::new(4096);
    let seg = fx.segment(4 * SHARE_MIN_PAGE_SIZE, SegMode::Dism);
    let att = fx.attach(&seg, 10);
    let avail = fx.store.availrmem();

    for _ in 0..2 {
        att.lockop(va(0), 20 * PAGE_SIZE, LockOp::Lock, None, 0).unwrap();
    }
    assert_eq!(att.locked_pages(), 20);
    assert_eq!(seg.lock_count(19), 1);
    assert_eq!(fx.ledger.usage(seg.project()), ptob(20));

    for _ in 0..2 {
        att.lockop(va(0), 20 * PAGE_SIZE, LockOp::Unlock, None, 0).unwrap();
    }
    assert_eq!(att.locked_pages(), 0);
    assert!((0..seg.npages()).all(|i| seg.lock_count(i) == 0));
    assert_eq!(fx.ledger.usage(seg.project()), 0);
    assert_eq!(fx.store.availrmem(), avail);
    assert!((0..seg.npages())
        .filter_map(|i| fx.store.lookup(seg.amp(), i))
        .all(|p| p.lckcnt() == 0 && !p.is_pinned()));
}

#[test]
fn test_partial_out_of_range_truncates() {
    let fx = Fixture::new(4096);
    let seg = fx.segment(2 * SHARE_MIN_PAGE_SIZE, SegMode::Dism);
    let att = fx.attach(&seg, 10);
    let last = seg.npages() - 2;

    // 只有最后两页在范围内
    att.lockop(va(last), 8 * PAGE_SIZE, LockOp::Lock, None, 0).unwrap();
    assert_eq!(att.locked_pages(), 2);
    assert_eq!(fx.ledger.usage(seg.project()), ptob(2));

    // 完全越界
    assert_eq!(
        att.lockop(va(seg.npages()), PAGE_SIZE, LockOp::Lock, None, 0),
        Err(SptError::NotMapped)
    );
    assert_eq!(
        att.lockop(VirtAddr::new(BASE - PAGE_SIZE), PAGE_SIZE, LockOp::Lock, None, 0),
        Err(SptError::NotMapped)
    );
    assert_eq!(att.locked_pages(), 2);
}

#[test]
fn test_failure_at_unit_k_rolls_back() {
    let fx = Fixture::new(4096);
    let seg = fx.segment(4 * SHARE_MIN_PAGE_SIZE, SegMode::Dism);
    let att = fx.attach(&seg, 10);
    let avail = fx.store.availrmem();

    for k in [0, 1, 17, 63] {
        fx.store.fail_pp_lock_after(k);
        assert_eq!(
            att.lockop(va(0), seg.realsize(), LockOp::Lock, None, 0),
            Err(SptError::ResourceExhausted),
            "k={}", k
        );
        fx.store.clear_pp_lock_failure();

        assert_eq!(att.locked_pages(), 0);
        assert!((0..seg.npages()).all(|i| seg.lock_count(i) == 0 && !att.is_locked(i)));
        assert_eq!(fx.ledger.usage(seg.project()), 0, "k={}", k);
        assert_eq!(fx.store.availrmem(), avail, "k={}", k);
    }
    assert!((0..seg.npages())
        .filter_map(|i| fx.store.lookup(seg.amp(), i))
        .all(|p| p.lckcnt() == 0 && !p.is_pinned()));
}

#[test]
fn test_parallel_failure_rolls_back() {
    let fx = Fixture::threaded(8192);
    let npages = 2048;
    let seg = fx.segment(ptob(npages), SegMode::Dism);
    let att = fx.attach(&seg, 10);
    let avail = fx.store.availrmem();

    fx.store.fail_pp_lock_after(1000);
    assert_eq!(
        att.lockop(va(0), seg.realsize(), LockOp::Lock, None, 0),
        Err(SptError::ResourceExhausted)
    );
    fx.store.clear_pp_lock_failure();
    assert_eq!(att.locked_pages(), 0);
    assert!((0..npages).all(|i| seg.lock_count(i) == 0));
    assert_eq!(fx.ledger.usage(seg.project()), 0);
    assert_eq!(fx.store.availrmem(), avail);

    // 同一范围重试成功
    att.lockop(va(0), seg.realsize(), LockOp::Lock, None, 0).unwrap();
    assert_eq!(att.locked_pages(), npages);
    assert_eq!(fx.ledger.usage(seg.project()), seg.realsize());
    att.lockop(va(0), seg.realsize(), LockOp::Unlock, None, 0).unwrap();
    assert_eq!(fx.store.availrmem(), avail);
}

#[test]
fn test_lock_respects_ledger_limit() {
    let fx = Fixture::new(4096);
    let seg = fx.segment(SHARE_MIN_PAGE_SIZE, SegMode::Dism);
    let att = fx.attach(&seg, 10);
    let avail = fx.store.availrmem();
    fx.ledger.set_limit(ProjectId::default(), ptob(4));

    assert_eq!(
        att.lockop(va(0), 8 * PAGE_SIZE, LockOp::Lock, None, 0),
        Err(SptError::ResourceExhausted)
    );
    assert_eq!(att.locked_pages(), 0);
    assert_eq!(fx.store.availrmem(), avail);

    att.lockop(va(0), 4 * PAGE_SIZE, LockOp::Lock, None, 0).unwrap();
    assert_eq!(fx.ledger.usage(ProjectId::default()), ptob(4));
}

#[test]
fn test_lock_respects_availrmem() {
    let fx = Fixture::new(4096);
    let seg = fx.segment(SHARE_MIN_PAGE_SIZE, SegMode::Dism);
    let att = fx.attach(&seg, 10);
    let avail = fx.store.availrmem();
    assert!(fx.store.reclaim_mem(avail - 4));

    assert_eq!(
        att.lockop(va(0), 8 * PAGE_SIZE, LockOp::Lock, None, 0),
        Err(SptError::ResourceExhausted)
    );
    assert_eq!(fx.ledger.usage(seg.project()), 0);
    assert_eq!(fx.store.availrmem(), 4);
    fx.store.release_mem(avail - 4);
}

/// 两个附着者锁定同一组页
#[test]
fn test_dism_two_attachers() {
    let fx = Fixture::new(4096);
    let seg = fx.segment(ptob(16), SegMode::Dism);
    let avail = fx.store.availrmem();
    let a = fx.attach(&seg, 10);
    let b = Attachment::attach(&seg, AsId(11), VirtAddr::new(BASE)).unwrap();

    a.lockop(va(0), 8 * PAGE_SIZE, LockOp::Lock, None, 0).unwrap();
    b.lockop(va(0), 8 * PAGE_SIZE, LockOp::Lock, None, 0).unwrap();
    assert_eq!(seg.lock_count(0), 2);
    // 第二次锁定不额外记账
    assert_eq!(fx.ledger.usage(seg.project()), ptob(8));

    // A 解锁后页仍被 B 锁定
    a.lockop(va(0), 8 * PAGE_SIZE, LockOp::Unlock, None, 0).unwrap();
    assert_eq!(seg.lock_count(0), 1);
    let page = fx.store.lookup(seg.amp(), 0).unwrap();
    assert_eq!(page.lckcnt(), 1);
    assert_eq!(fx.ledger.usage(seg.project()), ptob(8));
    assert_eq!(fx.store.availrmem(), avail - 8);

    // B 解锁后全部释放
    b.lockop(va(0), 8 * PAGE_SIZE, LockOp::Unlock, None, 0).unwrap();
    assert_eq!(page.lckcnt(), 0);
    assert_eq!(fx.ledger.usage(seg.project()), 0);
    assert_eq!(fx.store.availrmem(), avail);
}

/// OSM 的锁定与附着者无关
#[test]
fn test_osm_two_lockers() {
    let fx = Fixture::new(4096);
    let seg = fx.segment(ptob(256), SegMode::Osm { granule: GRANULE });
    let a = fx.attach(&seg, 10);
    let b = Attachment::attach(&seg, AsId(11), VirtAddr::new(BASE)).unwrap();
    let g0 = btop(GRANULE);

    a.lockop(va(0), GRANULE, LockOp::LockGranule, None, 0).unwrap();
    assert_eq!(fx.ledger.usage(seg.project()), GRANULE);
    assert_eq!(seg.allocated(), GRANULE);

    // B 锁定同一粒度不记账
    b.lockop(va(0), GRANULE, LockOp::LockGranule, None, 0).unwrap();
    assert_eq!(fx.ledger.usage(seg.project()), GRANULE);
    assert!((0..g0).all(|i| seg.lock_count(i) == 1));

    // 任何一方解锁都完全释放
    b.lockop(va(0), GRANULE, LockOp::UnlockGranule, None, 0).unwrap();
    assert_eq!(fx.ledger.usage(seg.project()), 0);
    assert_eq!(seg.allocated(), 0);
    assert!((0..g0).all(|i| seg.lock_count(i) == 0));
    assert!(fx.store.lookup(seg.amp(), 0).is_none());

    // 再次锁定时重新分配
    a.lockop(va(0), GRANULE, LockOp::LockGranule, None, 0).unwrap();
    assert!(fx.store.lookup(seg.amp(), 0).is_some());
    assert_eq!(fx.ledger.usage(seg.project()), GRANULE);
}

#[test]
fn test_disjoint_locks_concurrent() {
    let fx = Fixture::threaded(8192);
    let per = 4 * SHARE_MIN_PAGE_SIZE;
    let seg = fx.segment(4 * per, SegMode::Dism);
    let atts: Vec<Attachment> = (0..4).map(|i| fx.attach(&seg, 10 + i)).collect();
    let avail = fx.store.availrmem();

    std::thread::scope(|s| {
        for (i, att) in atts.iter().enumerate() {
            s.spawn(move || {
                let addr = VirtAddr::new(BASE + i * per);
                att.lockop(addr, per, LockOp::Lock, None, 0).unwrap();
            });
        }
    });
    assert_eq!(fx.ledger.usage(seg.project()), seg.realsize());
    assert!((0..seg.npages()).all(|i| seg.lock_count(i) == 1));
    assert_eq!(fx.store.availrmem(), avail - seg.npages());

    std::thread::scope(|s| {
        for (i, att) in atts.iter().enumerate() {
            s.spawn(move || {
                let addr = VirtAddr::new(BASE + i * per);
                att.lockop(addr, per, LockOp::Unlock, None, 0).unwrap();
            });
        }
    });
    assert_eq!(fx.ledger.usage(seg.project()), 0);
    assert_eq!(fx.store.availrmem(), avail);
}
