//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 匿名内存后备存储
//!
//! 共享段的物理页来自匿名对象 (anon map)：每个下标对应一个槽位，
//! 槽位在首次访问时零填充分配。本模块定义共享段需要的最小接口
//! `BackingStore`，并提供内存中的实现 `AnonStore`。
//!
//! `get_pages` 的语义：
//! - 整个范围都是空槽位：按请求的大小等级分配一组新页（独占钉住）
//! - 范围内已是同一等级的页：共享钉住后返回
//! - 已有更大的页：下标与其对齐时返回 `SizeUp`，否则返回其中的组成页
//! - 已有更小的页或部分为空：返回 `SizeDown`
//!
//! 常驻内存 (availrmem) 是一个独立的计数器，由调用方显式申领和归还。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use super::page::{is_p2aligned, ptob, Szc};
use super::page_desc::{Page, PageRef};
use crate::errno::SptError;

/// 匿名对象标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnonMapId(pub u32);

/// 内存标识：匿名槽位加页内偏移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemId {
    pub slot: usize,
    pub offset: usize,
}

/// `get_pages` 失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFail {
    /// 需要更小的页；`existing` 是范围内已有的较小等级
    SizeDown { existing: Option<Szc> },
    /// 范围内已有更大的页
    SizeUp { existing: Szc },
    /// 物理内存不足
    NoMem,
}

/// 后备存储接口
pub trait BackingStore: Send + Sync {
    /// 创建 `npages` 个槽位的匿名对象
    fn anonmap_alloc(&self, npages: usize) -> Result<AnonMapId, SptError>;

    /// 释放匿名对象及其所有页
    fn anonmap_free(&self, amp: AnonMapId);

    /// 预留交换空间
    fn swap_reserve(&self, npages: usize) -> bool;

    fn swap_unreserve(&self, npages: usize);

    /// 取得 `[idx, idx + szc.pagecnt())` 的一组页，返回的页已钉住
    fn get_pages(&self, amp: AnonMapId, idx: usize, szc: Szc) -> Result<Vec<PageRef>, AllocFail>;

    /// 查找已存在的页（不钉住）
    fn lookup(&self, amp: AnonMapId, idx: usize) -> Option<PageRef>;

    /// 丢弃 `[idx, idx + npages)` 中未被锁定的页
    fn disclaim(&self, amp: AnonMapId, idx: usize, npages: usize);

    /// 槽位标识，不存在时零填充创建
    fn anon_slot(&self, amp: AnonMapId, idx: usize) -> Result<usize, SptError>;

    /// mlock 计数加一，失败时页保持原状
    fn pp_lock(&self, page: &Page) -> bool;

    /// mlock 计数减一
    fn pp_unlock(&self, page: &Page);

    /// 申领常驻内存
    fn reclaim_mem(&self, npages: usize) -> bool;

    /// 归还常驻内存
    fn release_mem(&self, npages: usize);

    /// 当前可用常驻内存（页）
    fn availrmem(&self) -> usize;

    /// 分配 `[idx, idx + npages)` 的全部页，大小等级逐级回退
    ///
    /// 返回的页已钉住；失败时已钉住的页全部释放。
    fn create_pages(
        &self,
        amp: AnonMapId,
        idx: usize,
        npages: usize,
        szc: Szc,
    ) -> Result<Vec<PageRef>, SptError> {
        let mut pages: Vec<PageRef> = Vec::with_capacity(npages);
        let end = idx + npages;
        let mut pos = idx;

        while pos < end {
            let mut cur = Szc::largest_fitting(ptob(pos), ptob(end - pos), szc);
            let group = loop {
                match self.get_pages(amp, pos, cur) {
                    Ok(group) => break Ok(group),
                    Err(AllocFail::NoMem) => break Err(SptError::ResourceExhausted),
                    Err(AllocFail::SizeUp { existing }) if existing.pagecnt() <= end - pos => {
                        cur = existing;
                    }
                    Err(_) => match cur.smaller() {
                        Some(smaller) => cur = smaller,
                        None => break Err(SptError::internal("create_pages: no size fits")),
                    },
                }
            };
            match group {
                Ok(group) => {
                    pos += group.len();
                    pages.extend(group);
                }
                Err(err) => {
                    for page in &pages {
                        page.unpin();
                    }
                    return Err(err);
                }
            }
        }

        Ok(pages)
    }
}

// ============================================================
// 内存中的实现
// ============================================================

struct AnonMap {
    pages: Vec<Option<PageRef>>,
    slots: Vec<usize>,
}

struct StoreInner {
    maps: BTreeMap<AnonMapId, AnonMap>,
    next_map: u32,
    next_slot: usize,
    next_pfn: usize,
    free_pages: usize,
    swap_avail: usize,
}

/// 内存中的后备存储
///
/// 物理页总数、交换空间和大页上限都可配置；
/// `fail_pp_lock_after` 可以让第 k+1 次 `pp_lock` 失败。
pub struct AnonStore {
    inner: Mutex<StoreInner>,
    /// 常驻内存 (freemem_lock 保护的 availrmem)
    availrmem: Mutex<usize>,
    large_page_limit: AtomicU8,
    /// 剩余允许成功的 pp_lock 次数
    pp_lock_budget: AtomicUsize,
}

impl AnonStore {
    /// 创建有 `total_pages` 个物理页的存储
    pub fn new(total_pages: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                maps: BTreeMap::new(),
                next_map: 1,
                next_slot: 1,
                next_pfn: 0x1000,
                free_pages: total_pages,
                swap_avail: usize::MAX,
            }),
            availrmem: Mutex::new(total_pages),
            large_page_limit: AtomicU8::new(Szc::max().code()),
            pp_lock_budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// 限制交换空间
    pub fn with_swap(self, npages: usize) -> Self {
        self.inner.lock().swap_avail = npages;
        self
    }

    /// 限制可分配的最大页等级
    pub fn set_large_page_limit(&self, szc: Szc) {
        self.large_page_limit.store(szc.code(), Ordering::Release);
    }

    /// 之后第 `k + 1` 次 pp_lock 失败
    pub fn fail_pp_lock_after(&self, k: usize) {
        self.pp_lock_budget.store(k, Ordering::Release);
    }

    pub fn clear_pp_lock_failure(&self) {
        self.pp_lock_budget.store(usize::MAX, Ordering::Release);
    }

    /// 剩余空闲物理页
    pub fn free_pages(&self) -> usize {
        self.inner.lock().free_pages
    }

    /// 匿名对象中已存在的页数
    pub fn resident_pages(&self, amp: AnonMapId) -> usize {
        self.inner.lock().maps.get(&amp)
            .map(|map| map.pages.iter().filter(|p| p.is_some()).count())
            .unwrap_or(0)
    }

    fn large_page_limit(&self) -> Szc {
        Szc::new(self.large_page_limit.load(Ordering::Acquire)).unwrap_or(Szc::BASE)
    }
}

impl BackingStore for AnonStore {
    fn anonmap_alloc(&self, npages: usize) -> Result<AnonMapId, SptError> {
        let mut inner = self.inner.lock();
        let id = AnonMapId(inner.next_map);
        inner.next_map = inner.next_map.checked_add(1).ok_or(SptError::ResourceExhausted)?;
        inner.maps.insert(id, AnonMap {
            pages: (0..npages).map(|_| None).collect(),
            slots: alloc::vec![0; npages],
        });
        Ok(id)
    }

    fn anonmap_free(&self, amp: AnonMapId) {
        let mut inner = self.inner.lock();
        if let Some(map) = inner.maps.remove(&amp) {
            let freed = map.pages.iter().filter(|p| p.is_some()).count();
            inner.free_pages += freed;
        }
    }

    fn swap_reserve(&self, npages: usize) -> bool {
        let mut inner = self.inner.lock();
        if inner.swap_avail == usize::MAX {
            return true;
        }
        if inner.swap_avail < npages {
            return false;
        }
        inner.swap_avail -= npages;
        true
    }

    fn swap_unreserve(&self, npages: usize) {
        let mut inner = self.inner.lock();
        if inner.swap_avail != usize::MAX {
            inner.swap_avail += npages;
        }
    }

    fn get_pages(&self, amp: AnonMapId, idx: usize, szc: Szc) -> Result<Vec<PageRef>, AllocFail> {
        let limit = self.large_page_limit();
        let n = szc.pagecnt();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let map = match inner.maps.get_mut(&amp) {
            Some(map) => map,
            None => return Err(AllocFail::NoMem),
        };
        if idx + n > map.pages.len() || !is_p2aligned(idx, n) {
            return Err(AllocFail::SizeDown { existing: None });
        }

        let range = &map.pages[idx..idx + n];

        // 全部为空：分配新的一组
        if range.iter().all(|p| p.is_none()) {
            if szc > limit {
                return Err(AllocFail::SizeDown { existing: None });
            }
            if inner.free_pages < n {
                return Err(AllocFail::NoMem);
            }
            inner.free_pages -= n;
            let base_pfn = inner.next_pfn;
            inner.next_pfn += n;

            let mut group = Vec::with_capacity(n);
            for i in 0..n {
                let page = Arc::new(Page::new(base_pfn + i, idx + i, szc));
                page.try_pin_excl();
                map.pages[idx + i] = Some(page.clone());
                group.push(page);
            }
            return Ok(group);
        }

        // 已有更大的页
        if let Some(Some(first)) = range.first() {
            let existing = first.szc();
            if existing > szc && range.iter().all(|p| p.is_some()) {
                if is_p2aligned(idx, existing.pagecnt()) {
                    return Err(AllocFail::SizeUp { existing });
                }
                let group: Vec<PageRef> = range.iter().flatten().cloned().collect();
                for page in &group {
                    page.pin_shared();
                }
                return Ok(group);
            }
        }

        // 同等级：共享钉住后返回
        if range.iter().all(|p| matches!(p, Some(page) if page.szc() == szc)) {
            let group: Vec<PageRef> = range.iter().flatten().cloned().collect();
            for page in &group {
                page.pin_shared();
            }
            return Ok(group);
        }

        // 更小或部分为空
        let existing = range.iter()
            .flatten()
            .map(|p| p.szc())
            .filter(|&s| s < szc)
            .max();
        Err(AllocFail::SizeDown { existing })
    }

    fn lookup(&self, amp: AnonMapId, idx: usize) -> Option<PageRef> {
        let inner = self.inner.lock();
        inner.maps.get(&amp)?.pages.get(idx)?.clone()
    }

    fn disclaim(&self, amp: AnonMapId, idx: usize, npages: usize) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let map = match inner.maps.get_mut(&amp) {
            Some(map) => map,
            None => return,
        };
        let end = (idx + npages).min(map.pages.len());
        let mut freed = 0;
        let mut pos = idx;

        // 大页整体丢弃，任何组成页仍被锁定或钉住时整组保留
        while pos < end {
            let group = match &map.pages[pos] {
                Some(page) => page.root_index()..page.root_index() + page.szc().pagecnt(),
                None => {
                    pos += 1;
                    continue;
                }
            };
            let group = group.start..group.end.min(map.pages.len());
            let busy = map.pages[group.clone()].iter()
                .flatten()
                .any(|p| p.lckcnt() != 0 || p.is_pinned());
            if !busy {
                for slot in map.pages[group.clone()].iter_mut() {
                    if slot.take().is_some() {
                        freed += 1;
                    }
                }
            }
            pos = group.end.max(pos + 1);
        }

        inner.free_pages += freed;
        if freed > 0 {
            log::debug!("anon: disclaimed {} pages of {:?}", freed, amp);
        }
    }



    fn anon_slot(&self, amp: AnonMapId, idx: usize) -> Result<usize, SptError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let next = inner.next_slot;
        let map = inner.maps.get_mut(&amp).ok_or(SptError::NotMapped)?;
        let slot = map.slots.get_mut(idx).ok_or(SptError::NotMapped)?;
        if *slot == 0 {
            *slot = next;
            inner.next_slot += 1;
        }
        Ok(*slot)
    }

    fn pp_lock(&self, page: &Page) -> bool {
        let allowed = self.pp_lock_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok();
        allowed && page.inc_lckcnt(u32::MAX).is_some()
    }

    fn pp_unlock(&self, page: &Page) {
        if page.dec_lckcnt().is_none() {
            log::error!("anon: pp_unlock of unlocked page {:?}", page);
        }
    }

    fn reclaim_mem(&self, npages: usize) -> bool {
        let mut avail = self.availrmem.lock();
        if *avail < npages {
            return false;
        }
        *avail -= npages;
        true
    }

    fn release_mem(&self, npages: usize) {
        *self.availrmem.lock() += npages;
    }

    fn availrmem(&self) -> usize {
        *self.availrmem.lock()
    }
}
