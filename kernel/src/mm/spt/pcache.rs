//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 钉住缓存 (Page Cache / Pin Array)
//!
//! 异步 I/O 需要长期钉住共享段的页。为了不让每次 I/O 都逐页钉住，
//! 段维护一个所有附着者共享的钉住数组 `PinArray`：
//! - ISM 缓存全部页
//! - DISM / OSM 只缓存被锁定的页；大页中任一组成页被锁定时缓存整个大页
//!
//! 每个附着者在缓存中有一个条目，条目存在期间附着者的软锁计数加一。
//! `PinHandle` 释放时条目变为不活跃，`purge` 回收不活跃条目，
//! 最后一个条目被回收时销毁数组，代数加一并唤醒等待者。
//!
//! 状态：不存在 → 构建 → 存在[N] → 不存在；存在 → 标记过期 → 不存在
//!
//! 数组槽位只写一次。多页组按从高到低的顺序发布，根页最后发布，
//! 因此读者只要看到根页就能看到整个组。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Once;

use super::segment::SharedSegment;
use super::shm::SoftLocks;
use super::SegRw;
use crate::config::SPT_PCACHE_WAIT_SECS;
use crate::errno::SptError;
use crate::mm::page_desc::PageRef;
use crate::sync::WaitResult;

bitflags! {
    /// 缓存状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// 锁定状态已变化，数组需要重建
        const PPA_CHANGED = 1 << 0;
        /// OSM 粒度解锁正在释放内存，暂停缓存
        const MEM_FREED   = 1 << 1;
    }
}

/// 钉住数组，覆盖整个段
pub struct PinArray {
    slots: Box<[Once<PageRef>]>,
}

impl PinArray {
    fn new(npages: usize) -> Self {
        let slots: Vec<Once<PageRef>> = (0..npages).map(|_| Once::new()).collect();
        Self { slots: slots.into_boxed_slice() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&PageRef> {
        self.slots.get(idx)?.get()
    }

    /// 发布一页，槽位已占用时返回 false
    ///
    /// 只在缓存锁下调用
    fn publish(&self, idx: usize, page: PageRef) -> bool {
        match self.slots.get(idx) {
            Some(slot) if !slot.is_completed() => {
                slot.call_once(|| page);
                true
            }
            _ => false,
        }
    }

    /// 读取 `idx` 所在的整个组（无锁）
    ///
    /// 根页未发布时返回 None；根页可见时所有组成页都可见。
    pub fn group(&self, idx: usize) -> Option<Vec<PageRef>> {
        let page = self.get(idx)?;
        let root = page.root_index();
        let end = root + page.szc().pagecnt();
        self.get(root)?;
        (root..end).map(|i| self.get(i).cloned()).collect()
    }

    /// `[idx, idx + npages)` 的每个组都已完整发布
    fn covers(&self, idx: usize, npages: usize) -> bool {
        let end = idx + npages;
        let mut pos = idx;
        while pos < end {
            let page = match self.get(pos) {
                Some(page) => page,
                None => return false,
            };
            let root = page.root_index();
            if self.get(root).is_none() {
                return false;
            }
            pos = (root + page.szc().pagecnt()).max(pos + 1);
        }
        true
    }

    fn pages(&self) -> impl Iterator<Item = &PageRef> + '_ {
        self.slots.iter().filter_map(|slot| slot.get())
    }
}

impl core::fmt::Debug for PinArray {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PinArray")
            .field("len", &self.len())
            .field("cached", &self.pages().count())
            .finish()
    }
}

struct CacheEntry {
    owner: Arc<SoftLocks>,
    /// 未释放的句柄数
    active: usize,
}

/// 段的钉住缓存状态，由缓存锁 (spt_lock) 保护
pub struct PinCache {
    ppa: Option<Arc<PinArray>>,
    entries: Vec<CacheEntry>,
    flags: CacheFlags,
    gen: u64,
}

impl PinCache {
    pub(super) fn new() -> Self {
        Self {
            ppa: None,
            entries: Vec::new(),
            flags: CacheFlags::empty(),
            gen: 0,
        }
    }

    pub fn has_array(&self) -> bool {
        self.ppa.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.gen
    }

    pub fn flags(&self) -> CacheFlags {
        self.flags
    }

    pub fn entries(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn mark(&mut self, flags: CacheFlags) {
        self.flags.insert(flags);
    }

    pub(super) fn clear(&mut self, flags: CacheFlags) {
        self.flags.remove(flags);
    }

    /// 页是否在钉住数组中
    pub(super) fn is_cached(&self, idx: usize) -> bool {
        self.ppa.as_ref().map_or(false, |ppa| ppa.get(idx).is_some())
    }

    /// 取得 `[idx, idx + npages)` 的钉住句柄
    ///
    /// 返回 `Unsupported` 表示调用方应退回逐页 SoftLock。
    pub(super) fn lookup(
        &mut self,
        seg: &Arc<SharedSegment>,
        owner: &Arc<SoftLocks>,
        idx: usize,
        npages: usize,
        rw: SegRw,
    ) -> Result<PinHandle, SptError> {
        if self.flags.intersects(CacheFlags::PPA_CHANGED | CacheFlags::MEM_FREED) {
            self.purge(seg);
            return Err(SptError::Unsupported);
        }
        if npages == 0 || idx + npages > seg.npages() {
            return Err(SptError::Unsupported);
        }

        let ppa = match self.ppa.clone() {
            Some(ppa) => ppa,
            None => self.build(seg)?,
        };

        if !ppa.covers(idx, npages) {
            if self.entries.is_empty() {
                self.destroy(seg);
            }
            return Err(SptError::Unsupported);
        }

        match self.entries.iter_mut().find(|e| Arc::ptr_eq(&e.owner, owner)) {
            Some(entry) => entry.active += 1,
            None => {
                self.entries.push(CacheEntry { owner: owner.clone(), active: 1 });
                owner.hold(1);
            }
        }

        Ok(PinHandle {
            seg: seg.clone(),
            owner: owner.clone(),
            ppa,
            start: idx,
            npages,
            rw,
        })
    }

    /// 构建钉住数组
    fn build(&mut self, seg: &SharedSegment) -> Result<Arc<PinArray>, SptError> {
        let store = seg.ctx().store();
        let npages = seg.npages();
        let pageable = seg.kind().is_pageable();

        let mut cached: Vec<(usize, PageRef)> = Vec::new();
        let mut claim = 0;
        let mut pos = 0;
        while pos < npages {
            let page = match store.lookup(seg.amp(), pos) {
                Some(page) => page,
                None => {
                    pos += 1;
                    continue;
                }
            };
            let end = (page.root_index() + page.szc().pagecnt()).clamp(pos + 1, npages);
            let wanted = !pageable || (pos..end).any(|i| seg.lock_count(i) > 0);
            if wanted {
                let group: Option<Vec<PageRef>> = (pos..end).map(|i| store.lookup(seg.amp(), i)).collect();
                if let Some(group) = group {
                    for (i, page) in (pos..end).zip(group) {
                        page.pin_shared();
                        if page.lckcnt() == 0 {
                            claim += 1;
                        }
                        cached.push((i, page));
                    }
                }
            }
            pos = end;
        }

        if claim > 0 && !store.reclaim_mem(claim) {
            for (_, page) in &cached {
                page.unpin();
            }
            log::debug!("spt: pin array build needs {} pages of availrmem", claim);
            return Err(SptError::ResourceExhausted);
        }

        // 从高到低发布，根页最后
        let ppa = PinArray::new(npages);
        let ncached = cached.len();
        for (i, page) in cached.into_iter().rev() {
            ppa.publish(i, page);
        }
        let ppa = Arc::new(ppa);
        self.ppa = Some(ppa.clone());
        log::debug!("spt: pin array built, {} of {} pages cached", ncached, npages);
        Ok(ppa)
    }

    /// 把一组新锁定的页发布到已有数组（OSM 粒度锁定）
    ///
    /// 页的钉住转交给数组；没有数组时返回 false，钉住仍归调用方。
    pub(super) fn insert(&self, idx: usize, pages: &[PageRef]) -> bool {
        let ppa = match &self.ppa {
            Some(ppa) => ppa,
            None => return false,
        };
        for (i, page) in pages.iter().enumerate().rev() {
            if page.is_excl() {
                page.downgrade();
            }
            if !ppa.publish(idx + i, page.clone()) {
                page.unpin();
            }
        }
        true
    }

    /// 回收所有不活跃的条目，最后一个条目回收后销毁数组
    pub(super) fn purge(&mut self, seg: &SharedSegment) {
        let before = self.entries.len();
        self.entries.retain(|entry| {
            if entry.active != 0 {
                return true;
            }
            let _barrier = entry.owner.segfree.lock();
            entry.owner.release(1);
            false
        });
        let reclaimed = before - self.entries.len();
        if reclaimed > 0 {
            log::debug!("spt: purged {} pin cache entries", reclaimed);
        }
        if self.entries.is_empty() && self.ppa.is_some() {
            self.destroy(seg);
        }
    }

    /// 销毁数组：解除钉住、设置访问位、归还常驻内存
    fn destroy(&mut self, seg: &SharedSegment) {
        let ppa = match self.ppa.take() {
            Some(ppa) => ppa,
            None => return,
        };
        let mut release = 0;
        for page in ppa.pages() {
            page.set_refmod();
            if page.lckcnt() == 0 {
                release += 1;
            }
            page.unpin();
        }
        if release > 0 {
            seg.ctx().store().release_mem(release);
        }
        self.flags.remove(CacheFlags::PPA_CHANGED);
        self.gen += 1;
        seg.cache_cv.broadcast();
        log::debug!("spt: pin array destroyed, generation {}", self.gen);
    }

    /// 句柄释放
    fn release(&mut self, seg: &SharedSegment, owner: &Arc<SoftLocks>) {
        match self.entries.iter_mut().find(|e| Arc::ptr_eq(&e.owner, owner)) {
            Some(entry) => entry.active = entry.active.saturating_sub(1),
            None => log::error!("spt: released pin handle has no cache entry"),
        }
        if self.flags.contains(CacheFlags::PPA_CHANGED) || owner.unmap_waiting() || owner.is_orphaned() {
            self.purge(seg);
        }
    }
}

/// 等待钉住数组被销毁
///
/// 数组代数不变且 `PPA_CHANGED` 仍置位时等待，
/// 最多 `SPT_PCACHE_WAIT_SECS` 秒，可被信号中断。
pub(super) fn wait_for_purge(seg: &SharedSegment, owner: &SoftLocks) {
    let sched = seg.ctx().sched();
    let mut cache = seg.cache.lock();
    if !cache.has_array() {
        return;
    }
    let gen = cache.gen;
    owner.hold(1);

    let deadline = sched.ticks().saturating_add(SPT_PCACHE_WAIT_SECS.saturating_mul(sched.hz()));
    while cache.gen == gen && cache.flags.contains(CacheFlags::PPA_CHANGED) {
        let (guard, result) = seg.cache_cv.wait_timeout_sig(&seg.cache, cache, deadline, sched);
        cache = guard;
        if result != WaitResult::Signaled {
            log::debug!("spt: pin cache wait ended: {:?}", result);
            break;
        }
    }
    drop(cache);
    owner.release(1);
}

/// 钉住句柄
///
/// 持有期间页保持钉住；释放即页解锁。
pub struct PinHandle {
    seg: Arc<SharedSegment>,
    owner: Arc<SoftLocks>,
    ppa: Arc<PinArray>,
    start: usize,
    npages: usize,
    rw: SegRw,
}

impl PinHandle {
    /// 起始页下标
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.npages
    }

    pub fn is_empty(&self) -> bool {
        self.npages == 0
    }

    pub fn rw(&self) -> SegRw {
        self.rw
    }

    pub fn page(&self, i: usize) -> Option<&PageRef> {
        if i >= self.npages {
            return None;
        }
        self.ppa.get(self.start + i)
    }

    pub fn pages(&self) -> impl Iterator<Item = &PageRef> + '_ {
        (0..self.npages).filter_map(move |i| self.page(i))
    }

    /// 整个钉住数组
    pub fn array(&self) -> &Arc<PinArray> {
        &self.ppa
    }
}

impl Drop for PinHandle {
    fn drop(&mut self) {
        if self.rw == SegRw::Write {
            for page in self.pages() {
                page.set_refmod();
            }
        }
        let mut cache = self.seg.cache.lock();
        cache.release(&self.seg, &self.owner);
    }
}

impl core::fmt::Debug for PinHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PinHandle")
            .field("start", &self.start)
            .field("npages", &self.npages)
            .field("rw", &self.rw)
            .finish()
    }
}
