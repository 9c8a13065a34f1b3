//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 可换页段的锁定引擎
//!
//! 对应 `segspt_shmlockop()`：
//! - DISM：按页 mlock，每个附着者的锁定位图记录它锁定了哪些页，
//!   每页的锁计数是所有附着者锁定次数之和
//! - OSM：按粒度锁定，锁定与附着者无关，计数只有 0 和 1
//!
//! 锁定是一个事务：记账、钉住和发布要么全部完成，要么全部回退。
//! 记账在引擎锁下完成，按页 `lckcnt` 从 0 变 1 计费。
//! 常驻内存：`lckcnt > 0` 的页和钉住数组中 `lckcnt == 0` 的页各占一份，
//! 因此已在数组中的页锁定时不再申领。

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::fault::getpages;
use super::pcache::{self, CacheFlags};
use super::segment::SegKind;
use super::shm::{align_range, Attachment};
use super::LockOp;
use crate::config::{DISM_LOCK_MAX, VMTASK_LPGS_MINJOB, VMTASK_SPGS_MINJOB};
use crate::errno::SptError;
use crate::mm::bitmap::AtomicBitmap;
use crate::mm::page::{btop, is_p2aligned, p2align, p2roundup, ptob, VirtAddr, PAGE_SIZE};
use crate::mm::vmtask::run_job;

/// 锁定操作入口
pub(super) fn lockop(
    att: &Attachment,
    addr: VirtAddr,
    len: usize,
    op: LockOp,
    lockmap: Option<&AtomicBitmap>,
    pos: usize,
) -> Result<(), SptError> {
    att.live()?;
    let seg = att.segment();
    let granule = match (seg.kind(), op.is_granule()) {
        // ISM 永久锁定
        (SegKind::Ism, _) => return Ok(()),
        // OSM 只接受粒度操作
        (SegKind::Osm { .. }, false) => return Ok(()),
        (SegKind::Dism { .. }, true) => return Err(SptError::Unsupported),
        (SegKind::Osm { granule, .. }, true) => Some(*granule),
        (SegKind::Dism { .. }, false) => None,
    };

    if let Some(granule) = granule {
        let offset = addr.as_usize().wrapping_sub(att.base().as_usize());
        if !is_p2aligned(offset, granule) || !is_p2aligned(len, granule) {
            return Err(SptError::ConfigError);
        }
    }

    let (offset, len) = att.range(addr, len)?;
    let start = p2align(offset, PAGE_SIZE);
    let end = p2roundup(offset + len, PAGE_SIZE).min(seg.realsize());
    let idx = btop(start);
    let npages = btop(end - start);
    if npages == 0 {
        return Ok(());
    }

    if op.is_lock() {
        lock_range(att, idx, npages, granule.is_some(), lockmap, pos)
    } else {
        unlock_range(att, idx, npages, granule.is_some())
    }
}

/// 锁定 `[idx, idx + npages)`
fn lock_range(
    att: &Attachment,
    idx: usize,
    npages: usize,
    granule: bool,
    lockmap: Option<&AtomicBitmap>,
    pos: usize,
) -> Result<(), SptError> {
    let seg = att.segment();
    let ctx = seg.ctx();
    let store = ctx.store();
    let osm = seg.kind().is_osm();
    let locks = seg.kind().locks().ok_or(SptError::internal("lock on ISM segment"))?;
    let vpage = att.vpage();
    if !osm && vpage.is_none() {
        return Err(SptError::internal("DISM attachment without lock bitmap"));
    }

    // 按首选页大小向外对齐后取页
    let (a_start, a_end) = align_range(seg, ptob(idx), ptob(npages));
    let a_idx = btop(a_start);
    let a_npages = btop(a_end - a_start);
    let end = idx + npages;

    let _granule = if granule { seg.kind().mcglock().map(|l| l.write()) } else { None };
    let mut engine = seg.mlock.lock();
    let mut cache = seg.cache.lock();

    if !osm && cache.has_array() {
        cache.mark(CacheFlags::PPA_CHANGED);
    }

    let pages = getpages(seg, a_idx, a_npages)?;
    if pages.len() != a_npages {
        seg.unpin_pages(&pages);
        return Err(SptError::internal("getpages returned a short range"));
    }

    // 计算将要锁定的页和需要的记账
    let will_lock: Vec<bool> = (a_idx..a_idx + a_npages)
        .map(|i| {
            if i < idx || i >= end {
                return false;
            }
            let count = locks[i].load(Ordering::Acquire);
            if osm {
                count == 0
            } else {
                !vpage.map_or(false, |v| v.test(i)) && count < DISM_LOCK_MAX
            }
        })
        .collect();

    let mut charge = 0;
    let mut claim = 0;
    for (k, page) in pages.iter().enumerate() {
        if will_lock[k] && page.lckcnt() == 0 {
            charge += PAGE_SIZE;
            if !cache.is_cached(a_idx + k) {
                claim += 1;
            }
        }
    }

    if claim > 0 && !store.reclaim_mem(claim) {
        seg.unpin_pages(&pages);
        log::debug!("spt: lock of {} pages needs {} pages of availrmem", npages, claim);
        return Err(SptError::ResourceExhausted);
    }
    if let Err(err) = ctx.ledger().incr_locked_mem(seg.project(), charge) {
        store.release_mem(claim);
        seg.unpin_pages(&pages);
        return Err(err);
    }

    // DISM 按页分块，OSM 按大页分块
    let (unit, minjob) = if osm {
        (seg.pref_szc().pagecnt(), VMTASK_LPGS_MINJOB)
    } else {
        (1, VMTASK_SPGS_MINJOB)
    };
    let nunits = (a_npages + unit - 1) / unit;
    let done = AtomicBitmap::new(a_npages);
    let nlocked = AtomicUsize::new(0);
    let hit_max = AtomicBool::new(false);

    let lock = |us: usize, ue: usize| {
        for u in us..ue {
            let lo = u * unit;
            let hi = (lo + unit).min(a_npages);
            for k in lo..hi {
                if !will_lock[k] {
                    continue;
                }
                let i = a_idx + k;
                if !store.pp_lock(&pages[k]) {
                    return (Err(SptError::ResourceExhausted), u + 1);
                }
                let count = locks[i].fetch_add(1, Ordering::AcqRel) + 1;
                if count >= DISM_LOCK_MAX {
                    hit_max.store(true, Ordering::Relaxed);
                }
                if let Some(v) = vpage {
                    v.set(i);
                }
                done.set(k);
                if let Some(map) = lockmap {
                    map.set(pos + (i - idx));
                }
                nlocked.fetch_add(1, Ordering::Relaxed);
            }
        }
        (Ok(()), ue)
    };
    let undo = |us: usize, ue: usize| {
        let hi = (ue * unit).min(a_npages);
        for k in us * unit..hi {
            if !done.clear(k) {
                continue;
            }
            let i = a_idx + k;
            store.pp_unlock(&pages[k]);
            locks[i].fetch_sub(1, Ordering::AcqRel);
            if let Some(v) = vpage {
                v.clear(i);
            }
            if let Some(map) = lockmap {
                map.clear(pos + (i - idx));
            }
            nlocked.fetch_sub(1, Ordering::Relaxed);
        }
    };

    if let Err(err) = run_job(ctx.dispatcher(), nunits, minjob, &lock, Some(&undo)) {
        ctx.ledger().decr_locked_mem(seg.project(), charge);
        store.release_mem(claim);
        seg.unpin_pages(&pages);
        log::debug!("spt: lock of [{}, {}) rolled back: {}", idx, end, err);
        return Err(err);
    }

    if hit_max.load(Ordering::Relaxed) && !engine.lock_max_warned {
        engine.lock_max_warned = true;
        log::warn!("spt: page lock count reached {}, further locks are ignored", DISM_LOCK_MAX);
    }
    let nlocked = nlocked.load(Ordering::Relaxed);
    if !osm {
        att.add_locked(nlocked);
    }

    if osm {
        // 新锁定的大页发布到钉住数组，钉住随之转交
        let mut k = 0;
        while k < a_npages {
            let hi = (k + unit).min(a_npages);
            let fresh = (k..hi).any(|j| done.test(j));
            if !(fresh && cache.insert(a_idx + k, &pages[k..hi])) {
                seg.unpin_pages(&pages[k..hi]);
            }
            k = hi;
        }
        seg.add_allocated(charge);
    } else {
        seg.unpin_pages(&pages);
        if cache.has_array() {
            cache.mark(CacheFlags::PPA_CHANGED);
        }
    }

    log::debug!("spt: {:?} locked {} pages in [{}, {})", att.asid(), nlocked, idx, end);
    Ok(())
}

/// 解锁 `[idx, idx + npages)`
///
/// DISM 只解锁本附着者锁定的页；OSM 解锁范围内所有已锁定的粒度，
/// 粒度解锁时还要等钉住数组销毁后丢弃这些页。
pub(super) fn unlock_range(
    att: &Attachment,
    idx: usize,
    npages: usize,
    granule: bool,
) -> Result<(), SptError> {
    let seg = att.segment();
    let ctx = seg.ctx();
    let store = ctx.store();
    let osm = seg.kind().is_osm();
    let locks = match seg.kind().locks() {
        Some(locks) => locks,
        None => return Ok(()),
    };
    let vpage = att.vpage();
    if !granule && att.locked_pages() == 0 {
        return Ok(());
    }

    let end = (idx + npages).min(seg.npages());
    let _granule = if granule { seg.kind().mcglock().map(|l| l.write()) } else { None };
    let engine = seg.mlock.lock();
    let mut cache = seg.cache.lock();

    if cache.has_array() {
        cache.mark(CacheFlags::PPA_CHANGED);
    }
    if osm {
        cache.mark(CacheFlags::MEM_FREED);
    }
    let cached: Vec<bool> = (idx..end).map(|i| cache.is_cached(i)).collect();

    let unit = if osm { seg.pref_szc().pagecnt() } else { 1 };
    let minjob = if osm { VMTASK_LPGS_MINJOB } else { VMTASK_SPGS_MINJOB };
    let n = end.saturating_sub(idx);
    let nunits = (n + unit - 1) / unit;
    let unlocked = AtomicUsize::new(0);
    let nlck = AtomicUsize::new(0);
    let mine = AtomicUsize::new(0);

    let unlock = |us: usize, ue: usize| {
        for k in us * unit..(ue * unit).min(n) {
            let i = idx + k;
            let held = if osm {
                locks[i].load(Ordering::Acquire) != 0
            } else {
                vpage.map_or(false, |v| v.test(i))
            };
            if !held {
                continue;
            }
            match store.lookup(seg.amp(), i) {
                Some(page) => {
                    store.pp_unlock(&page);
                    if page.lckcnt() == 0 {
                        unlocked.fetch_add(1, Ordering::Relaxed);
                        if !cached[k] {
                            nlck.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                None => log::error!("spt: locked page {} missing at unlock", i),
            }
            if vpage.map_or(false, |v| v.clear(i)) {
                mine.fetch_add(1, Ordering::Relaxed);
            }
            let _ = locks[i].fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        }
        (Ok(()), ue)
    };
    run_job(ctx.dispatcher(), nunits, minjob, &unlock, None)?;

    let unlocked = unlocked.load(Ordering::Relaxed);
    let nlck = nlck.load(Ordering::Relaxed);
    if nlck > 0 {
        store.release_mem(nlck);
    }
    ctx.ledger().decr_locked_mem(seg.project(), ptob(unlocked));
    if osm {
        seg.sub_allocated(ptob(unlocked));
    }
    att.sub_locked(mine.load(Ordering::Relaxed));

    cache.purge(seg);
    drop(cache);
    drop(engine);

    if granule {
        pcache::wait_for_purge(seg, att.softlocks());
        store.disclaim(seg.amp(), idx, n);
        seg.cache.lock().clear(CacheFlags::MEM_FREED);
    }

    log::debug!("spt: {:?} unlocked [{}, {}), {} pages released", att.asid(), idx, end, unlocked);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use crate::config::SHARE_MIN_PAGE_SIZE;
    use crate::mm::anon::{AnonStore, BackingStore};
    use crate::mm::hat::{AsId, SoftHat};
    use crate::mm::rctl::ProjectLedger;
    use crate::mm::spt::{Collaborators, SegMode, SegmentConfig, SharedSegment, SptContext};

    const BASE: usize = 0x4000_0000;

    fn setup(mode: SegMode, size: usize) -> (Arc<AnonStore>, Arc<ProjectLedger>, Arc<SharedSegment>) {
        let store = Arc::new(AnonStore::new(4096));
        let ledger = Arc::new(ProjectLedger::new());
        let ctx = SptContext::new(
            Collaborators::new(store.clone(), Arc::new(SoftHat::new())).with_ledger(ledger.clone()),
        );
        let seg = SharedSegment::create(&ctx, SegmentConfig::new(size, mode)).unwrap();
        (store, ledger, seg)
    }

    #[test]
    fn test_dism_lock_unlock() {
        let (store, ledger, seg) = setup(SegMode::Dism, 4 * SHARE_MIN_PAGE_SIZE);
        let avail = store.availrmem();
        let att = Attachment::attach(&seg, AsId(10), VirtAddr::new(BASE)).unwrap();

        att.lockop(VirtAddr::new(BASE), 3 * PAGE_SIZE, LockOp::Lock, None, 0).unwrap();
        assert_eq!(att.locked_pages(), 3);
        assert_eq!(seg.lock_count(0), 1);
        assert_eq!(seg.lock_count(3), 0);
        assert_eq!(ledger.usage(seg.project()), 3 * PAGE_SIZE);
        assert_eq!(store.availrmem(), avail - 3);

        // 重复锁定不增加计数
        att.lockop(VirtAddr::new(BASE), 3 * PAGE_SIZE, LockOp::Lock, None, 0).unwrap();
        assert_eq!(seg.lock_count(0), 1);
        assert_eq!(ledger.usage(seg.project()), 3 * PAGE_SIZE);

        att.lockop(VirtAddr::new(BASE), 3 * PAGE_SIZE, LockOp::Unlock, None, 0).unwrap();
        assert_eq!(att.locked_pages(), 0);
        assert_eq!(seg.lock_count(0), 0);
        assert_eq!(ledger.usage(seg.project()), 0);
        assert_eq!(store.availrmem(), avail);
    }

    #[test]
    fn test_lockmap_positions() {
        let (_, _, seg) = setup(SegMode::Dism, SHARE_MIN_PAGE_SIZE);
        let att = Attachment::attach(&seg, AsId(10), VirtAddr::new(BASE)).unwrap();
        let map = AtomicBitmap::new(8);
        att.lockop(VirtAddr::new(BASE + PAGE_SIZE), 2 * PAGE_SIZE, LockOp::Lock, Some(&map), 4).unwrap();
        assert!(map.test(4) && map.test(5));
        assert_eq!(map.count_ones(), 2);
    }

    #[test]
    fn test_granule_ops_rejected_on_dism() {
        let (_, _, seg) = setup(SegMode::Dism, SHARE_MIN_PAGE_SIZE);
        let att = Attachment::attach(&seg, AsId(10), VirtAddr::new(BASE)).unwrap();
        assert_eq!(
            att.lockop(VirtAddr::new(BASE), SHARE_MIN_PAGE_SIZE, LockOp::LockGranule, None, 0),
            Err(SptError::Unsupported)
        );
    }

    #[test]
    fn test_ism_lock_is_noop() {
        let (_, ledger, seg) = setup(SegMode::Ism, SHARE_MIN_PAGE_SIZE);
        let att = Attachment::attach(&seg, AsId(10), VirtAddr::new(BASE)).unwrap();
        let before = ledger.usage(seg.project());
        att.lockop(VirtAddr::new(BASE), PAGE_SIZE, LockOp::Lock, None, 0).unwrap();
        assert_eq!(ledger.usage(seg.project()), before);
    }

    #[test]
    fn test_osm_granule_alignment() {
        let granule = SHARE_MIN_PAGE_SIZE;
        let (_, _, seg) = setup(SegMode::Osm { granule }, 4 * granule);
        let att = Attachment::attach(&seg, AsId(10), VirtAddr::new(BASE)).unwrap();
        assert_eq!(
            att.lockop(VirtAddr::new(BASE + PAGE_SIZE), granule, LockOp::LockGranule, None, 0),
            Err(SptError::ConfigError)
        );
        assert_eq!(
            att.lockop(VirtAddr::new(BASE), granule / 2, LockOp::LockGranule, None, 0),
            Err(SptError::ConfigError)
        );
        // 非粒度操作被忽略
        att.lockop(VirtAddr::new(BASE), granule, LockOp::Lock, None, 0).unwrap();
        assert_eq!(seg.allocated(), 0);
    }

    #[test]
    fn test_osm_granule_lock_and_free() {
        let granule = SHARE_MIN_PAGE_SIZE;
        let (store, ledger, seg) = setup(SegMode::Osm { granule }, 4 * granule);
        let att = Attachment::attach(&seg, AsId(10), VirtAddr::new(BASE)).unwrap();

        att.lockop(VirtAddr::new(BASE + granule), granule, LockOp::LockGranule, None, 0).unwrap();
        assert_eq!(seg.allocated(), granule);
        assert_eq!(ledger.usage(seg.project()), granule);
        let first = btop(granule);
        assert_eq!(seg.lock_count(first), 1);

        att.lockop(VirtAddr::new(BASE + granule), granule, LockOp::UnlockGranule, None, 0).unwrap();
        assert_eq!(seg.allocated(), 0);
        assert_eq!(ledger.usage(seg.project()), 0);
        // 解锁的粒度被丢弃
        assert!(store.lookup(seg.amp(), first).is_none());
        assert!(store.lookup(seg.amp(), 0).is_some());
    }

    #[test]
    fn test_pp_lock_failure_rolls_back() {
        let (store, ledger, seg) = setup(SegMode::Dism, 2 * SHARE_MIN_PAGE_SIZE);
        let avail = store.availrmem();
        let att = Attachment::attach(&seg, AsId(10), VirtAddr::new(BASE)).unwrap();
        store.fail_pp_lock_after(5);
        assert_eq!(
            att.lockop(VirtAddr::new(BASE), 8 * PAGE_SIZE, LockOp::Lock, None, 0),
            Err(SptError::ResourceExhausted)
        );
        store.clear_pp_lock_failure();
        assert_eq!(att.locked_pages(), 0);
        assert!((0..8).all(|i| seg.lock_count(i) == 0 && !att.is_locked(i)));
        assert_eq!(ledger.usage(seg.project()), 0);
        assert_eq!(store.availrmem(), avail);
        let page = store.lookup(seg.amp(), 0).unwrap();
        assert_eq!(page.lckcnt(), 0);
        assert!(!page.is_pinned());
    }
}
