//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 共享段缺页处理
//!
//! 对应 `segspt_shmfault()` / `segspt_dismfault()`：
//! 请求范围先截断到段的实际大小，再向外对齐到首选页大小，
//! 然后按缺页类型装入、锁定或解锁映射。
//!
//! DISM 缺失的页通过 `getpages` 按需分配。后备存储可能要求更小
//! 或更大的页，`getpages` 用一个有界的状态机在页大小等级之间移动：
//! 同一位置每个等级最多尝试一次。

use alloc::vec::Vec;

use super::segment::{SegKind, SharedSegment};
use super::shm::Attachment;
use super::{FaultKind, SegRw};
use crate::errno::SptError;
use crate::mm::anon::AllocFail;
use crate::mm::hat::{seg_addr, HatLoad, Prot};
use crate::mm::page::{btop, is_p2aligned, p2align, p2roundup, ptob, Szc, VirtAddr};
use crate::mm::page_desc::PageRef;

/// 缺页处理入口
pub(super) fn fault(
    att: &Attachment,
    addr: VirtAddr,
    len: usize,
    kind: FaultKind,
    rw: SegRw,
) -> Result<(), SptError> {
    let seg = att.segment();
    let (offset, len) = att.range(addr, len)?;

    if kind == FaultKind::ProtectionCheck {
        // 共享段总是可读写
        return Ok(());
    }

    let pgsz = seg.pref_szc().size();
    let a_start = p2align(offset, pgsz);
    let a_end = p2roundup(offset + len, pgsz).min(seg.realsize());
    let idx = btop(a_start);
    let npages = btop(a_end - a_start);

    match kind {
        FaultKind::SoftUnlock => {
            softunlock(att, idx, npages, rw);
            Ok(())
        }
        FaultKind::SoftLock | FaultKind::Invalidate => {
            if rw == SegRw::Exec && !seg.prot().contains(Prot::EXEC) {
                return Err(SptError::NotMapped);
            }
            if kind == FaultKind::SoftLock {
                softlock(att, idx, npages)
            } else {
                invalidate(att, idx, npages)
            }
        }
        FaultKind::ProtectionCheck => Ok(()),
    }
}

/// 装入并锁定映射，页保持钉住
fn softlock(att: &Attachment, idx: usize, npages: usize) -> Result<(), SptError> {
    let seg = att.segment();
    let hat = seg.ctx().hat();

    att.softlocks().hold(npages);
    let pages = match pin_range(seg, idx, npages) {
        Ok(pages) => pages,
        Err(err) => {
            att.softlocks().release(npages);
            return Err(err);
        }
    };

    if let Err(err) = hat.memload_array(seg.seg_as(), seg_addr(idx), &pages, seg.prot(),
                                        HatLoad::LOCK | HatLoad::SHARE) {
        seg.unpin_pages(&pages);
        att.softlocks().release(npages);
        return Err(err);
    }
    Ok(())
}

/// 装入映射后立即解除钉住
fn invalidate(att: &Attachment, idx: usize, npages: usize) -> Result<(), SptError> {
    let seg = att.segment();
    let pages = pin_range(seg, idx, npages)?;
    let result = seg.ctx().hat().memload_array(seg.seg_as(), seg_addr(idx), &pages, seg.prot(),
                                               HatLoad::SHARE);
    seg.unpin_pages(&pages);
    result
}

/// 撤销 SoftLock
fn softunlock(att: &Attachment, idx: usize, npages: usize, rw: SegRw) {
    let seg = att.segment();
    let ctx = seg.ctx();
    let store = ctx.store();

    ctx.hat().unlock(seg.seg_as(), seg_addr(idx), ptob(npages));
    for i in idx..idx + npages {
        match store.lookup(seg.amp(), i) {
            Some(page) => {
                if rw == SegRw::Write {
                    page.set_refmod();
                } else {
                    page.set_ref();
                }
                page.unpin();
            }
            None => log::error!("spt: softunlock of missing page {}", i),
        }
    }
    att.softlocks().release(npages);
}

/// 钉住 `[idx, idx + npages)` 的全部页
fn pin_range(seg: &SharedSegment, idx: usize, npages: usize) -> Result<Vec<PageRef>, SptError> {
    let store = seg.ctx().store();
    match seg.kind() {
        SegKind::Dism { .. } => getpages(seg, idx, npages),
        SegKind::Ism => {
            let mut pages = Vec::with_capacity(npages);
            for i in idx..idx + npages {
                match store.lookup(seg.amp(), i) {
                    Some(page) => {
                        page.pin_shared();
                        pages.push(page);
                    }
                    None => {
                        seg.unpin_pages(&pages);
                        return Err(SptError::internal("ISM page missing"));
                    }
                }
            }
            Ok(pages)
        }
        SegKind::Osm { mcglock, .. } => {
            let _granule = mcglock.read();
            let mut pages = Vec::with_capacity(npages);
            for i in idx..idx + npages {
                let page = if seg.lock_count(i) == 0 {
                    None
                } else {
                    store.lookup(seg.amp(), i)
                };
                match page {
                    Some(page) => {
                        page.pin_shared();
                        pages.push(page);
                    }
                    None => {
                        seg.unpin_pages(&pages);
                        return Err(SptError::NotMapped);
                    }
                }
            }
            Ok(pages)
        }
    }
}

/// 不超过 `szc`、在 `pos` 处对齐且不越过 `end` 的最大等级
fn fit(seg: &SharedSegment, pos: usize, end: usize, szc: Szc) -> Szc {
    let mut cur = szc.min(seg.szc_at(pos));
    while let Some(smaller) = cur.smaller() {
        if is_p2aligned(pos, cur.pagecnt()) && pos + cur.pagecnt() <= end {
            break;
        }
        cur = smaller;
    }
    cur
}

/// 取得 `[start, start + npages)` 的全部页，返回的页已钉住
///
/// 对应 `spt_anon_getpages()`。失败时释放本次已钉住的页。
pub(super) fn getpages(seg: &SharedSegment, start: usize, npages: usize) -> Result<Vec<PageRef>, SptError> {
    let store = seg.ctx().store();
    let end = start + npages;
    let mut pages: Vec<PageRef> = Vec::with_capacity(npages);
    let mut pos = start;
    let mut cur = fit(seg, pos, end, seg.szc_at(pos));
    // 当前位置已尝试过的等级
    let mut visited: u32 = 0;

    while pos < end {
        let bit = 1u32 << cur.code();
        if visited & bit != 0 {
            seg.unpin_pages(&pages);
            return Err(SptError::internal("page size walk revisited a size class"));
        }
        visited |= bit;

        match store.get_pages(seg.amp(), pos, cur) {
            Ok(group) => {
                if group.is_empty() || pos + group.len() > end {
                    seg.unpin_pages(&group);
                    seg.unpin_pages(&pages);
                    return Err(SptError::internal("backing store returned a bad page group"));
                }
                pos += group.len();
                pages.extend(group);
                visited = 0;
                if pos < end {
                    // 到达首选页边界时重新从首选大小开始
                    let pref = seg.szc_at(pos);
                    let next = if is_p2aligned(pos, pref.pagecnt()) { pref } else { cur };
                    cur = fit(seg, pos, end, next);
                }
            }
            Err(AllocFail::SizeDown { existing }) => {
                #[cfg(feature = "debug_log")]
                log::trace!("spt: getpages size down at {} from {:?} (existing {:?})", pos, cur, existing);
                match existing.filter(|e| *e < cur).or_else(|| cur.smaller()) {
                    Some(next) => cur = next,
                    None => {
                        seg.unpin_pages(&pages);
                        return Err(SptError::internal("no smaller page size"));
                    }
                }
            }
            Err(AllocFail::SizeUp { existing }) => {
                #[cfg(feature = "debug_log")]
                log::trace!("spt: getpages size up at {} from {:?} to {:?}", pos, cur, existing);
                let n = existing.pagecnt();
                if existing <= cur || !is_p2aligned(pos, n) || pos + n > end {
                    seg.unpin_pages(&pages);
                    return Err(SptError::internal("larger page overruns the range"));
                }
                cur = existing;
            }
            Err(AllocFail::NoMem) => {
                seg.unpin_pages(&pages);
                return Err(SptError::ResourceExhausted);
            }
        }
    }

    Ok(pages)
}
