//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 共享段的附着 (shm segment)
//!
//! 每个附着的地址空间对应一个 `Attachment`：
//! - 通过 `hat.share` 共享段的页表
//! - DISM 段有逐页锁定位图，记录本附着者锁定了哪些页；
//!   OSM 的锁定与附着者无关，只记在段的锁计数里
//! - `SoftLocks` 与本附着者拥有的钉住缓存条目共享
//!
//! 解除附着前必须等软锁清空；钉住缓存条目也计入软锁。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::pcache::{self, CacheFlags, PinHandle};
use super::segment::{SegKind, SharedSegment};
use super::{fault, lockop, FaultKind, LockOp, SegRw};
use crate::config::{DISM_LOCK_MAX, SPT_DETACH_WAIT_TICKS};
use crate::errno::SptError;
use crate::mm::anon::MemId;
use crate::mm::bitmap::AtomicBitmap;
use crate::mm::hat::{AsId, Prot};
use crate::mm::page::{btop, btopr, is_p2aligned, p2align, p2phase, p2roundup, Szc, VirtAddr, PAGE_SIZE};
use crate::mm::policy::MemPolicy;
use crate::sched::Scheduler;
use crate::sync::{CondVar, WaitResult};

bitflags! {
    /// 映射类型
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegType: u32 {
        const SHARED    = 1 << 0;
        /// 不预留交换空间（ISM）
        const NORESERVE = 1 << 1;
    }
}

bitflags! {
    /// mincore 结果
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Incore: u8 {
        const INCORE = 1 << 0;
        const LOCKED = 1 << 1;
        const ANON   = 1 << 2;
    }
}

/// 段能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegCap {
    LockGranule,
}

/// madvise 行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    Normal,
    /// 丢弃未锁定的页 (DISM)
    Free,
    /// 下次访问的节点上分配
    AccessDefault,
    /// 访问线程所在的节点上分配
    AccessLwp,
    /// 多个线程访问，分散分配
    AccessMany,
}

// ============================================================
// 软锁
// ============================================================

/// 附着者的软锁计数
///
/// 计数归零时唤醒等待解除附着的线程。
#[derive(Debug, Default)]
pub struct SoftLocks {
    count: AtomicIsize,
    unmapwait: AtomicBool,
    /// 附着已被强制拆除，缓存条目在句柄释放时回收
    orphaned: AtomicBool,
    cv: CondVar,
    waitlock: Mutex<()>,
    /// 拆除屏障：回收缓存条目和解除附着互斥
    pub(super) segfree: Mutex<()>,
}

impl SoftLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> isize {
        self.count.load(Ordering::Acquire)
    }

    pub fn unmap_waiting(&self) -> bool {
        self.unmapwait.load(Ordering::Acquire)
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }

    pub(super) fn hold(&self, n: usize) {
        self.count.fetch_add(n as isize, Ordering::AcqRel);
    }

    pub(super) fn release(&self, n: usize) {
        let now = self.count.fetch_sub(n as isize, Ordering::AcqRel) - n as isize;
        if now < 0 {
            log::error!("spt: softlock count went negative ({})", now);
        }
        if now <= 0 {
            let _guard = self.waitlock.lock();
            self.cv.broadcast();
        }
    }

    /// 等待计数归零，超时或被信号中断时返回 `Busy`
    fn wait_drained(&self, sched: &dyn Scheduler, deadline: u64) -> Result<(), SptError> {
        self.unmapwait.store(true, Ordering::Release);
        let mut guard = self.waitlock.lock();
        let result = loop {
            if self.count() <= 0 {
                break Ok(());
            }
            let (next, wait) = self.cv.wait_timeout_sig(&self.waitlock, guard, deadline, sched);
            guard = next;
            if wait != WaitResult::Signaled && self.count() > 0 {
                break Err(SptError::Busy);
            }
        };
        drop(guard);
        self.unmapwait.store(false, Ordering::Release);
        result
    }
}

// ============================================================
// 附着
// ============================================================

/// 一个地址空间对共享段的附着
pub struct Attachment {
    seg: Arc<SharedSegment>,
    asid: AsId,
    base: VirtAddr,
    size: usize,
    softlocks: Arc<SoftLocks>,
    /// 本附着者锁定的页 (DISM)
    vpage: Option<AtomicBitmap>,
    /// 本附着者锁定的页数
    locked: AtomicUsize,
    detached: AtomicBool,
}

impl Attachment {
    /// 把段附着到 `asid` 的 `base` 处
    ///
    /// `base` 必须按段的首选页大小对齐。
    pub fn attach(seg: &Arc<SharedSegment>, asid: AsId, base: VirtAddr) -> Result<Self, SptError> {
        if seg.is_freed() {
            return Err(SptError::NotMapped);
        }
        if !is_p2aligned(base.as_usize(), seg.pref_szc().size()) {
            return Err(SptError::ConfigError);
        }
        seg.ctx().hat().share(asid, base, seg.seg_as(), seg.size())?;

        let vpage = seg.kind().is_dism().then(|| AtomicBitmap::new(seg.npages()));
        seg.attach_ref();
        log::debug!("spt: {:?} attached at {:#x}", asid, base.as_usize());
        Ok(Self::new(seg.clone(), asid, base, vpage, 0))
    }

    fn new(seg: Arc<SharedSegment>, asid: AsId, base: VirtAddr, vpage: Option<AtomicBitmap>, locked: usize) -> Self {
        let size = seg.size();
        Self {
            seg,
            asid,
            base,
            size,
            softlocks: Arc::new(SoftLocks::new()),
            vpage,
            locked: AtomicUsize::new(locked),
            detached: AtomicBool::new(false),
        }
    }

    /// 复制附着（fork）
    ///
    /// 子地址空间在同一地址共享页表；锁定位图被深拷贝，
    /// 继承的每个 DISM 锁使页的锁计数加一，但不重复记账。
    pub fn duplicate(&self, child: AsId) -> Result<Self, SptError> {
        self.live()?;
        let seg = &self.seg;
        let ctx = seg.ctx();
        ctx.hat().share(child, self.base, seg.seg_as(), self.size)?;

        let mut inherited = 0;
        let vpage = match (&self.vpage, seg.kind()) {
            (Some(parent), SegKind::Dism { locks }) => {
                let store = ctx.store();
                let copy = AtomicBitmap::new(parent.len());
                let _engine = seg.mlock.lock();
                for (i, count) in locks.iter().enumerate() {
                    if !parent.test(i) || count.load(Ordering::Acquire) >= DISM_LOCK_MAX {
                        continue;
                    }
                    let page = match store.lookup(seg.amp(), i) {
                        Some(page) => page,
                        None => {
                            log::error!("spt: locked page {} missing at duplicate", i);
                            continue;
                        }
                    };
                    if !store.pp_lock(&page) {
                        continue;
                    }
                    count.fetch_add(1, Ordering::AcqRel);
                    copy.set(i);
                    inherited += 1;
                }
                Some(copy)
            }
            _ => None,
        };

        seg.attach_ref();
        log::debug!("spt: {:?} duplicated into {:?}, {} locks inherited", self.asid, child, inherited);
        Ok(Self::new(seg.clone(), child, self.base, vpage, inherited))
    }

    /// 解除附着
    ///
    /// 必须覆盖整个附着范围；仍有软锁时先清理一次钉住缓存，
    /// 清理后仍有软锁则返回 `Busy`。
    pub fn detach(&self, addr: VirtAddr, len: usize) -> Result<(), SptError> {
        self.live()?;
        if addr != self.base || len != self.size {
            return Err(SptError::ConfigError);
        }
        if self.softlocks.count() > 0 {
            self.seg.purge();
            if self.softlocks.count() > 0 {
                return Err(SptError::Busy);
            }
        }
        self.teardown()
    }

    /// 归还锁、撤销共享页表并减少段的附着计数
    fn teardown(&self) -> Result<(), SptError> {
        let seg = &self.seg;
        if seg.kind().is_dism() && self.locked_pages() > 0 {
            lockop::unlock_range(self, 0, seg.npages(), false)?;
        }
        seg.ctx().hat().unshare(self.asid, self.base, self.size);

        let _barrier = self.softlocks.segfree.lock();
        if self.detached.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(vpage) = &self.vpage {
            for i in 0..vpage.len() {
                vpage.clear(i);
            }
        }
        seg.detach_ref();
        log::debug!("spt: {:?} detached from {:#x}", self.asid, self.base.as_usize());
        Ok(())
    }

    /// 等待软锁清空，最多 `timeout` 个时钟滴答
    pub fn wait_unmap(&self, timeout: u64) -> Result<(), SptError> {
        let sched = self.seg.ctx().sched();
        let deadline = sched.ticks().saturating_add(timeout);
        self.softlocks.wait_drained(sched, deadline)
    }

    /// 缺页处理
    pub fn fault(&self, addr: VirtAddr, len: usize, kind: FaultKind, rw: SegRw) -> Result<(), SptError> {
        fault::fault(self, addr, len, kind, rw)
    }

    /// 锁定或解锁
    ///
    /// `lockmap` 的第 `pos + k` 位在范围内第 `k` 页被锁定时置位。
    pub fn lockop(
        &self,
        addr: VirtAddr,
        len: usize,
        op: LockOp,
        lockmap: Option<&AtomicBitmap>,
        pos: usize,
    ) -> Result<(), SptError> {
        lockop::lockop(self, addr, len, op, lockmap, pos)
    }

    /// 通过钉住缓存钉住一段页（异步 I/O）
    ///
    /// 返回 `Unsupported` 时调用方应改用 SoftLock。
    pub fn pagelock(&self, addr: VirtAddr, len: usize, rw: SegRw) -> Result<PinHandle, SptError> {
        let (offset, len) = self.range(addr, len)?;
        let idx = btop(offset);
        let npages = btopr(offset + len) - idx;
        let mut cache = self.seg.cache.lock();
        cache.lookup(&self.seg, &self.softlocks, idx, npages, rw)
    }

    // ========== 查询 ==========

    /// 每页的保护位
    pub fn getprot(&self, addr: VirtAddr, len: usize) -> Result<Vec<Prot>, SptError> {
        let (offset, len) = self.range(addr, len)?;
        let npages = btopr(offset + len) - btop(offset);
        Ok(alloc::vec![self.seg.prot(); npages])
    }

    pub fn gettype(&self, addr: VirtAddr) -> Result<SegType, SptError> {
        self.range(addr, 1)?;
        let mut ty = SegType::SHARED;
        if !self.seg.kind().is_pageable() {
            ty |= SegType::NORESERVE;
        }
        Ok(ty)
    }

    /// 共享段没有文件偏移
    pub fn getoffset(&self, _addr: VirtAddr) -> usize {
        0
    }

    /// 请求的保护位必须是段保护位的子集
    pub fn checkprot(&self, addr: VirtAddr, len: usize, prot: Prot) -> Result<(), SptError> {
        self.range(addr, len)?;
        if self.seg.prot().contains(prot) {
            Ok(())
        } else {
            Err(SptError::AccessDenied)
        }
    }

    pub fn getmemid(&self, addr: VirtAddr) -> Result<MemId, SptError> {
        let (offset, _) = self.range(addr, 1)?;
        let slot = self.seg.ctx().store().anon_slot(self.seg.amp(), btop(offset))?;
        Ok(MemId { slot, offset: p2phase(offset, PAGE_SIZE) })
    }

    pub fn getpolicy(&self, addr: VirtAddr) -> Result<Option<MemPolicy>, SptError> {
        let (offset, _) = self.range(addr, 1)?;
        Ok(self.seg.ctx().policy().get_policy(self.seg.amp(), btop(offset)))
    }

    pub fn capable(&self, cap: SegCap) -> bool {
        match cap {
            SegCap::LockGranule => self.seg.kind().is_osm(),
        }
    }

    /// 每页的驻留状态
    pub fn incore(&self, addr: VirtAddr, len: usize) -> Result<Vec<Incore>, SptError> {
        let (offset, len) = self.range(addr, len)?;
        let start = btop(offset);
        let end = btopr(offset + len);
        let seg = &self.seg;

        if !seg.kind().is_pageable() {
            return Ok(alloc::vec![Incore::INCORE | Incore::LOCKED | Incore::ANON; end - start]);
        }

        let store = seg.ctx().store();
        let osm = seg.kind().is_osm();
        Ok((start..end)
            .map(|i| {
                let mut state = Incore::empty();
                if store.lookup(seg.amp(), i).is_some() {
                    state |= Incore::INCORE | Incore::ANON;
                }
                let locked = if osm { seg.lock_count(i) > 0 } else { self.is_locked(i) };
                if locked {
                    state |= Incore::LOCKED;
                }
                state
            })
            .collect())
    }

    /// madvise
    pub fn advise(&self, addr: VirtAddr, len: usize, advice: Advice) -> Result<(), SptError> {
        let seg = &self.seg;
        match advice {
            Advice::Normal => {
                self.range(addr, len)?;
                Ok(())
            }
            Advice::Free => {
                let (offset, len) = self.range(addr, len)?;
                if !seg.kind().is_dism() {
                    return Ok(());
                }
                {
                    let mut cache = seg.cache.lock();
                    if cache.has_array() {
                        cache.mark(CacheFlags::PPA_CHANGED);
                        cache.purge(seg);
                    }
                }
                pcache::wait_for_purge(seg, &self.softlocks);
                let idx = btop(offset);
                seg.ctx().store().disclaim(seg.amp(), idx, btop(len));
                Ok(())
            }
            Advice::AccessDefault | Advice::AccessLwp | Advice::AccessMany => {
                if let Some(granule) = seg.kind().granule() {
                    let offset = addr.as_usize().wrapping_sub(self.base.as_usize());
                    if !is_p2aligned(offset, granule) || !is_p2aligned(len, granule) {
                        return Err(SptError::ConfigError);
                    }
                }
                let (offset, len) = self.range(addr, len)?;
                let policy = match advice {
                    Advice::AccessLwp => MemPolicy::NextCpu,
                    Advice::AccessMany => MemPolicy::Random,
                    _ => MemPolicy::NextTouch,
                };
                let idx = btop(offset);
                let npages = btopr(offset + len) - idx;
                let already = seg.ctx().policy().set_policy(seg.amp(), idx, npages, policy);
                if !already && self.softlocks.count() > 0 {
                    seg.purge();
                }
                Ok(())
            }
        }
    }

    /// 共享段不支持改变页大小
    pub fn set_pagesize(&self, _addr: VirtAddr, _len: usize, _szc: Szc) -> Result<(), SptError> {
        Err(SptError::Unsupported)
    }

    /// 匿名共享内存无需同步
    pub fn sync(&self, addr: VirtAddr, len: usize) -> Result<(), SptError> {
        self.range(addr, len)?;
        Ok(())
    }

    /// 共享段的页不被换出
    pub fn swapout(&self) -> usize {
        0
    }

    // ========== 访问器 ==========

    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.seg
    }

    pub fn asid(&self) -> AsId {
        self.asid
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn softlock_count(&self) -> isize {
        self.softlocks.count()
    }

    /// 是否有线程在等待软锁清空
    pub fn unmap_waiting(&self) -> bool {
        self.softlocks.unmap_waiting()
    }

    /// 本附着者锁定的页数
    pub fn locked_pages(&self) -> usize {
        self.locked.load(Ordering::Acquire)
    }

    /// 本附着者是否锁定了第 `idx` 页
    pub fn is_locked(&self, idx: usize) -> bool {
        self.vpage.as_ref().map_or(false, |v| v.test(idx))
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(super) fn softlocks(&self) -> &Arc<SoftLocks> {
        &self.softlocks
    }

    pub(super) fn vpage(&self) -> Option<&AtomicBitmap> {
        self.vpage.as_ref()
    }

    pub(super) fn add_locked(&self, n: usize) {
        self.locked.fetch_add(n, Ordering::AcqRel);
    }

    pub(super) fn sub_locked(&self, n: usize) {
        let _ = self.locked.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            Some(v.saturating_sub(n))
        });
    }

    pub(super) fn live(&self) -> Result<(), SptError> {
        if self.is_detached() {
            Err(SptError::NotMapped)
        } else {
            Ok(())
        }
    }

    /// 检查并截断范围，返回 `(段内偏移, 截断后的长度)`
    ///
    /// 起点超出实际大小时返回 `NotMapped`。
    pub(super) fn range(&self, addr: VirtAddr, len: usize) -> Result<(usize, usize), SptError> {
        self.live()?;
        let offset = addr.as_usize()
            .checked_sub(self.base.as_usize())
            .ok_or(SptError::NotMapped)?;
        let realsize = self.seg.realsize();
        if offset >= realsize || len == 0 {
            return Err(SptError::NotMapped);
        }
        Ok((offset, len.min(realsize - offset)))
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if self.is_detached() {
            return;
        }
        let result = match self.detach(self.base, self.size) {
            Err(SptError::Busy) => self.wait_unmap(SPT_DETACH_WAIT_TICKS)
                .and_then(|()| self.detach(self.base, self.size)),
            other => other,
        };
        match result {
            Ok(()) => {}
            Err(SptError::Busy) => {
                // 异步 I/O 未完成：先拆除附着，缓存条目随最后一个句柄回收
                log::warn!("spt: {:?} dropped with {} softlocks outstanding",
                    self.asid, self.softlock_count());
                self.softlocks.orphaned.store(true, Ordering::Release);
                self.seg.purge();
                if let Err(err) = self.teardown() {
                    log::error!("spt: {:?} teardown failed: {}", self.asid, err);
                }
            }
            Err(err) => log::warn!("spt: {:?} dropped while attached: {}", self.asid, err),
        }
    }
}

impl core::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Attachment")
            .field("asid", &self.asid)
            .field("base", &self.base)
            .field("size", &self.size)
            .field("softlocks", &self.softlock_count())
            .field("locked", &self.locked_pages())
            .finish()
    }
}

/// 按首选页大小向外对齐一个段内范围，结果不超过实际大小
pub(super) fn align_range(seg: &SharedSegment, offset: usize, len: usize) -> (usize, usize) {
    let pgsz = seg.pref_szc().size();
    let start = p2align(offset, pgsz);
    let end = p2roundup(offset + len, pgsz).min(seg.realsize());
    (start, end)
}
