//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 共享段的创建与释放
//!
//! 对应 `segspt_create()` / `segspt_free()`：
//! - ISM：创建时分配全部物理页，记账、锁定并装入共享页表
//! - OSM：创建时分配全部物理页，但不记账也不锁定
//! - DISM：只建立元数据，页在缺页或锁定时按需分配
//!
//! 段的大小有两个：
//! - `size`：按首选页大小（OSM 按粒度）取整的名义大小
//! - `realsize`：按最小共享页大小取整的实际大小，物理页只覆盖这部分

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};

use spin::{Mutex, RwLock};

use super::pcache::{CacheFlags, PinCache};
use crate::config::{DEFAULT_SHARE_SZC, MINFREE_DIVISOR, VMTASK_SPGS_MINJOB};
use crate::errno::SptError;
use crate::mm::anon::{AnonMapId, BackingStore};
use crate::mm::hat::{seg_addr, AsId, Hat, HatCap, HatLoad, HatUnload, Prot};
use crate::mm::page::{btop, is_power_of_two, p2align, p2roundup, ptob, Szc};
use crate::mm::page_desc::PageRef;
use crate::mm::policy::{MemPolicy, PolicyAdvisor, PolicyTable};
use crate::mm::rctl::{Ledger, ProjectId, ProjectLedger};
use crate::mm::vmtask::{run_job, SerialDispatcher, TaskDispatcher};
use crate::sched::{Scheduler, SpinScheduler};
use crate::sync::CondVar;

// ============================================================
// 进程级状态
// ============================================================

/// 外部协作者
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn BackingStore>,
    pub hat: Arc<dyn Hat>,
    pub ledger: Arc<dyn Ledger>,
    pub policy: Arc<dyn PolicyAdvisor>,
    pub sched: Arc<dyn Scheduler>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
}

impl Collaborators {
    /// 其余协作者使用默认实现
    pub fn new(store: Arc<dyn BackingStore>, hat: Arc<dyn Hat>) -> Self {
        Self {
            store,
            hat,
            ledger: Arc::new(ProjectLedger::new()),
            policy: Arc::new(PolicyTable::new()),
            sched: Arc::new(SpinScheduler::new()),
            dispatcher: Arc::new(SerialDispatcher),
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn PolicyAdvisor>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_scheduler(mut self, sched: Arc<dyn Scheduler>) -> Self {
        self.sched = sched;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }
}

/// 统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SptStats {
    /// ISM 永久锁定的页数
    pub spt_used: usize,
    /// 存活的段数
    pub segments: usize,
    /// 为系统保留的常驻内存下限
    pub minfree: usize,
    pub availrmem: usize,
}

/// SPT 进程级上下文
pub struct SptContext {
    collab: Collaborators,
    spt_used: AtomicUsize,
    nsegs: AtomicUsize,
    minfree: usize,
    next_as: AtomicU32,
}

impl SptContext {
    /// 初始化，`minfree` 取当前可用常驻内存的 1/MINFREE_DIVISOR
    pub fn new(collab: Collaborators) -> Arc<Self> {
        let minfree = collab.store.availrmem() / MINFREE_DIVISOR;
        log::debug!("spt: context init, minfree={} pages", minfree);
        Arc::new(Self {
            collab,
            spt_used: AtomicUsize::new(0),
            nsegs: AtomicUsize::new(0),
            minfree,
            next_as: AtomicU32::new(1),
        })
    }

    pub fn store(&self) -> &dyn BackingStore {
        &*self.collab.store
    }

    pub fn hat(&self) -> &dyn Hat {
        &*self.collab.hat
    }

    pub fn ledger(&self) -> &dyn Ledger {
        &*self.collab.ledger
    }

    pub fn policy(&self) -> &dyn PolicyAdvisor {
        &*self.collab.policy
    }

    pub fn sched(&self) -> &dyn Scheduler {
        &*self.collab.sched
    }

    pub fn dispatcher(&self) -> &dyn TaskDispatcher {
        &*self.collab.dispatcher
    }

    pub fn stats(&self) -> SptStats {
        SptStats {
            spt_used: self.spt_used.load(Ordering::Acquire),
            segments: self.nsegs.load(Ordering::Acquire),
            minfree: self.minfree,
            availrmem: self.store().availrmem(),
        }
    }

    /// 关闭上下文，仍有存活的段时返回 `Busy`
    pub fn teardown(&self) -> Result<(), SptError> {
        let live = self.nsegs.load(Ordering::Acquire);
        if live != 0 {
            log::debug!("spt: teardown refused, {} segments alive", live);
            return Err(SptError::Busy);
        }
        let used = self.spt_used.load(Ordering::Acquire);
        if used != 0 {
            return Err(SptError::internal("spt_used nonzero with no segments"));
        }
        log::debug!("spt: context teardown");
        Ok(())
    }

    /// 分配地址空间标识
    pub fn alloc_asid(&self) -> AsId {
        AsId(self.next_as.fetch_add(1, Ordering::Relaxed))
    }

    /// 为永久锁定的页申领常驻内存，至少保留 `minfree`
    fn claim_wired(&self, npages: usize) -> bool {
        let avail = self.store().availrmem();
        if avail < npages.saturating_add(self.minfree) {
            log::debug!("spt: wire {} pages refused, availrmem={} minfree={}",
                        npages, avail, self.minfree);
            return false;
        }
        self.store().reclaim_mem(npages)
    }
}

// ============================================================
// 段配置
// ============================================================

/// 段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegMode {
    Ism,
    Dism,
    /// `granule`：锁定粒度（字节，2 的幂，不小于首选页大小）
    Osm { granule: usize },
}

/// 创建参数
#[derive(Debug, Clone, Copy)]
pub struct SegmentConfig {
    pub size: usize,
    pub prot: Prot,
    pub mode: SegMode,
    /// 首选页大小建议
    pub page_size: Option<usize>,
    pub policy: MemPolicy,
    pub project: ProjectId,
}

impl SegmentConfig {
    pub fn new(size: usize, mode: SegMode) -> Self {
        Self {
            size,
            prot: Prot::READ | Prot::WRITE | Prot::USER,
            mode,
            page_size: None,
            policy: MemPolicy::Default,
            project: ProjectId::default(),
        }
    }

    pub fn with_prot(mut self, prot: Prot) -> Self {
        self.prot = prot;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_policy(mut self, policy: MemPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_project(mut self, project: ProjectId) -> Self {
        self.project = project;
        self
    }
}

/// 每页锁计数
pub type LockCounts = Box<[AtomicU16]>;

fn new_lock_counts(npages: usize) -> LockCounts {
    let counts: Vec<AtomicU16> = (0..npages).map(|_| AtomicU16::new(0)).collect();
    counts.into_boxed_slice()
}

/// 段类型及其专有状态
pub enum SegKind {
    Ism,
    Dism {
        locks: LockCounts,
    },
    Osm {
        locks: LockCounts,
        granule: usize,
        /// 粒度操作的读写锁
        mcglock: RwLock<()>,
    },
}

impl SegKind {
    pub fn locks(&self) -> Option<&[AtomicU16]> {
        match self {
            SegKind::Ism => None,
            SegKind::Dism { locks } | SegKind::Osm { locks, .. } => Some(locks),
        }
    }

    pub fn is_pageable(&self) -> bool {
        !matches!(self, SegKind::Ism)
    }

    pub fn is_osm(&self) -> bool {
        matches!(self, SegKind::Osm { .. })
    }

    pub fn is_dism(&self) -> bool {
        matches!(self, SegKind::Dism { .. })
    }

    pub fn granule(&self) -> Option<usize> {
        match self {
            SegKind::Osm { granule, .. } => Some(*granule),
            _ => None,
        }
    }

    pub(super) fn mcglock(&self) -> Option<&RwLock<()>> {
        match self {
            SegKind::Osm { mcglock, .. } => Some(mcglock),
            _ => None,
        }
    }
}

impl core::fmt::Debug for SegKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SegKind::Ism => write!(f, "Ism"),
            SegKind::Dism { locks } => write!(f, "Dism({} pages)", locks.len()),
            SegKind::Osm { locks, granule, .. } => {
                write!(f, "Osm({} pages, granule={:#x})", locks.len(), granule)
            }
        }
    }
}

/// 引擎锁保护的状态
pub(super) struct EngineState {
    /// 锁计数饱和的警告只打印一次
    pub(super) lock_max_warned: bool,
}

// ============================================================
// 共享段
// ============================================================

/// 共享段
pub struct SharedSegment {
    ctx: Arc<SptContext>,
    kind: SegKind,
    prot: Prot,
    size: usize,
    realsize: usize,
    szc: Szc,
    amp: AnonMapId,
    project: ProjectId,
    /// 段内部的地址空间
    seg_as: AsId,
    pub(super) cache: Mutex<PinCache>,
    pub(super) cache_cv: CondVar,
    /// 引擎锁 (shm_mlock)
    pub(super) mlock: Mutex<EngineState>,
    attached: AtomicUsize,
    /// OSM 已锁定的字节数
    allocated: AtomicUsize,
    /// ISM 页终生钉住（平台不支持动态解除映射时）
    ism_pinned: bool,
    /// ISM 已完成记账和锁定
    ism_wired: AtomicBool,
    freed: AtomicBool,
}

impl SharedSegment {
    /// 创建共享段
    pub fn create(ctx: &Arc<SptContext>, config: SegmentConfig) -> Result<Arc<Self>, SptError> {
        if config.size == 0 || config.size.checked_add(Szc::max().size()).is_none() {
            return Err(SptError::ConfigError);
        }

        let share_min = Szc::share_min();
        let szc = match config.page_size {
            Some(size) => {
                let szc = Szc::from_size(size).ok_or(SptError::ConfigError)?;
                if szc < share_min {
                    return Err(SptError::ConfigError);
                }
                szc
            }
            None => Szc::new(DEFAULT_SHARE_SZC).unwrap_or(share_min).max(share_min),
        };

        let (size, realsize) = match config.mode {
            SegMode::Osm { granule } => {
                if !is_power_of_two(granule) || granule < szc.size() {
                    return Err(SptError::ConfigError);
                }
                if !ctx.hat().supported(HatCap::LockGranule) {
                    return Err(SptError::Unsupported);
                }
                let size = p2roundup(config.size, granule);
                (size, size)
            }
            _ => (p2roundup(config.size, szc.size()), p2roundup(config.size, share_min.size())),
        };
        let npages = btop(realsize);

        let kind = match config.mode {
            SegMode::Ism => SegKind::Ism,
            SegMode::Dism => SegKind::Dism { locks: new_lock_counts(npages) },
            SegMode::Osm { granule } => SegKind::Osm {
                locks: new_lock_counts(npages),
                granule,
                mcglock: RwLock::new(()),
            },
        };

        // OSM 不预留交换空间
        let store = ctx.store();
        let swap = if kind.is_osm() { 0 } else { npages };
        if swap > 0 && !store.swap_reserve(swap) {
            return Err(SptError::ResourceExhausted);
        }
        let amp = match store.anonmap_alloc(npages) {
            Ok(amp) => amp,
            Err(err) => {
                store.swap_unreserve(swap);
                return Err(err);
            }
        };
        ctx.policy().set_policy(amp, 0, npages, config.policy);

        ctx.nsegs.fetch_add(1, Ordering::AcqRel);
        let seg = Arc::new(Self {
            ctx: ctx.clone(),
            kind,
            prot: config.prot,
            size,
            realsize,
            szc,
            amp,
            project: config.project,
            seg_as: ctx.alloc_asid(),
            cache: Mutex::new(PinCache::new()),
            cache_cv: CondVar::new(),
            mlock: Mutex::new(EngineState { lock_max_warned: false }),
            attached: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
            ism_pinned: !ctx.hat().supported(HatCap::DynamicIsmUnmap),
            ism_wired: AtomicBool::new(false),
            freed: AtomicBool::new(false),
        });

        // 失败时由 Drop 释放匿名对象和交换空间
        match config.mode {
            SegMode::Ism => seg.populate_ism()?,
            SegMode::Osm { .. } => seg.populate_osm()?,
            SegMode::Dism => {}
        }

        log::debug!("spt: created {:?} segment size={:#x} realsize={:#x} pgsz={:#x}",
                    seg.kind, size, realsize, szc.size());
        Ok(seg)
    }

    fn populate_ism(&self) -> Result<(), SptError> {
        let pages = self.ctx.store().create_pages(self.amp, 0, self.npages(), self.szc)?;
        let result = self.wire_ism(&pages);
        if result.is_err() || !self.ism_pinned {
            self.unpin_pages(&pages);
        }
        result
    }

    /// 记账、锁定并装入全部 ISM 页
    fn wire_ism(&self, pages: &[PageRef]) -> Result<(), SptError> {
        let ctx = &*self.ctx;
        let store = ctx.store();
        let npages = pages.len();
        let _engine = self.mlock.lock();

        let unlocked = ptob(pages.iter().filter(|p| p.lckcnt() == 0).count());
        ctx.ledger().incr_locked_mem(self.project, unlocked)?;
        if !ctx.claim_wired(npages) {
            ctx.ledger().decr_locked_mem(self.project, unlocked);
            return Err(SptError::ResourceExhausted);
        }

        let lock = |start: usize, end: usize| {
            for i in start..end {
                if !store.pp_lock(&pages[i]) {
                    return (Err(SptError::ResourceExhausted), i);
                }
            }
            (Ok(()), end)
        };
        let unlock = |start: usize, end: usize| {
            for page in &pages[start..end] {
                store.pp_unlock(page);
            }
        };
        let undo_accounting = || {
            store.release_mem(npages);
            ctx.ledger().decr_locked_mem(self.project, unlocked);
        };

        if let Err(err) = run_job(ctx.dispatcher(), npages, VMTASK_SPGS_MINJOB, &lock, Some(&unlock)) {
            undo_accounting();
            return Err(err);
        }

        // 一次装入一个大页
        let mut flags = HatLoad::SHARE;
        if self.ism_pinned {
            flags |= HatLoad::LOCK;
        }
        let mut pos = 0;
        while pos < npages {
            let page = &pages[pos];
            let end = (page.root_index() + page.szc().pagecnt()).clamp(pos + 1, npages);
            if let Err(err) = ctx.hat().memload_array(self.seg_as, seg_addr(pos), &pages[pos..end],
                                                      self.prot, flags) {
                log::debug!("spt: ISM load failed at page {}: {}", pos, err);
                ctx.hat().unload(self.seg_as, seg_addr(0), ptob(pos), HatUnload::UNLOCK | HatUnload::UNMAP);
                unlock(0, npages);
                undo_accounting();
                return Err(SptError::ResourceExhausted);
            }
            pos = end;
        }

        self.ism_wired.store(true, Ordering::Release);
        ctx.spt_used.fetch_add(npages, Ordering::AcqRel);
        Ok(())
    }

    /// OSM 预先分配全部页，不记账不锁定
    fn populate_osm(&self) -> Result<(), SptError> {
        let pages = self.ctx.store().create_pages(self.amp, 0, self.npages(), self.szc)?;
        self.unpin_pages(&pages);
        Ok(())
    }

    /// 释放共享段
    ///
    /// 仍有附着者或钉住数组时返回 `Busy`；重复调用无副作用。
    pub fn free(&self) -> Result<(), SptError> {
        if self.freed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.attached.load(Ordering::Acquire) != 0 {
            return Err(SptError::Busy);
        }

        let engine = self.mlock.lock();
        if self.cache.lock().has_array() {
            return Err(SptError::Busy);
        }
        if self.freed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let ctx = &*self.ctx;
        let store = ctx.store();
        let npages = self.npages();

        let mut unload = HatUnload::UNMAP;
        if self.ism_pinned {
            unload |= HatUnload::UNLOCK;
        }
        ctx.hat().unload(self.seg_as, seg_addr(0), self.size, unload);

        if self.ism_wired.load(Ordering::Acquire) {
            let mut refund = 0;
            for idx in 0..npages {
                let page = match store.lookup(self.amp, idx) {
                    Some(page) => page,
                    None => {
                        log::error!("spt: ISM page {} missing at free", idx);
                        continue;
                    }
                };
                store.pp_unlock(&page);
                if page.lckcnt() == 0 {
                    refund += 1;
                }
                if self.ism_pinned {
                    page.unpin();
                }
            }
            store.release_mem(npages);
            ctx.ledger().decr_locked_mem(self.project, ptob(refund));
            ctx.spt_used.fetch_sub(npages, Ordering::AcqRel);
        }

        // 仍被锁定的页（OSM 粒度锁与进程无关，会留到这里）
        if let Some(locks) = self.kind.locks() {
            let mut unlocked = 0;
            for (idx, count) in locks.iter().enumerate() {
                let mut n = count.swap(0, Ordering::AcqRel);
                if n == 0 {
                    continue;
                }
                let page = match store.lookup(self.amp, idx) {
                    Some(page) => page,
                    None => {
                        log::error!("spt: locked page {} missing at free", idx);
                        continue;
                    }
                };
                while n > 0 {
                    store.pp_unlock(&page);
                    n -= 1;
                }
                if page.lckcnt() == 0 {
                    unlocked += 1;
                }
            }
            if unlocked > 0 {
                store.release_mem(unlocked);
                ctx.ledger().decr_locked_mem(self.project, ptob(unlocked));
            }
            self.allocated.store(0, Ordering::Release);
        }
        drop(engine);

        ctx.policy().forget(self.amp);
        store.anonmap_free(self.amp);
        if !self.kind.is_osm() {
            store.swap_unreserve(npages);
        }
        ctx.nsegs.fetch_sub(1, Ordering::AcqRel);

        log::debug!("spt: freed {:?} segment, {} pages", self.kind, npages);
        Ok(())
    }

    /// 回收钉住缓存中不活跃的条目
    pub fn purge(&self) {
        self.cache.lock().purge(self);
    }

    // ========== 内部工具 ==========

    /// 释放一批钉住
    pub(super) fn unpin_pages(&self, pages: &[PageRef]) {
        let unpin = |start: usize, end: usize| {
            for page in &pages[start..end] {
                page.unpin();
            }
            (Ok(()), end)
        };
        // 工作函数不会失败
        let _ = run_job(self.ctx.dispatcher(), pages.len(), VMTASK_SPGS_MINJOB, &unpin, None);
    }

    /// 下标处应使用的页大小等级，尾部不足首选页大小的部分使用最小共享页
    pub(super) fn szc_at(&self, idx: usize) -> Szc {
        if ptob(idx) >= p2align(self.realsize, self.szc.size()) {
            Szc::share_min().min(self.szc)
        } else {
            self.szc
        }
    }

    pub(super) fn attach_ref(&self) {
        self.attached.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn detach_ref(&self) {
        self.attached.fetch_sub(1, Ordering::AcqRel);
    }

    pub(super) fn add_allocated(&self, bytes: usize) {
        self.allocated.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(super) fn sub_allocated(&self, bytes: usize) {
        let _ = self.allocated.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            Some(n.saturating_sub(bytes))
        });
    }

    // ========== 查询 ==========

    pub fn ctx(&self) -> &Arc<SptContext> {
        &self.ctx
    }

    pub fn kind(&self) -> &SegKind {
        &self.kind
    }

    pub fn prot(&self) -> Prot {
        self.prot
    }

    /// 名义大小
    pub fn size(&self) -> usize {
        self.size
    }

    /// 实际大小
    pub fn realsize(&self) -> usize {
        self.realsize
    }

    pub fn npages(&self) -> usize {
        btop(self.realsize)
    }

    /// 首选页大小等级
    pub fn pref_szc(&self) -> Szc {
        self.szc
    }

    pub fn amp(&self) -> AnonMapId {
        self.amp
    }

    pub fn project(&self) -> ProjectId {
        self.project
    }

    pub fn seg_as(&self) -> AsId {
        self.seg_as
    }

    pub fn attachments(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// OSM 已锁定的字节数
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// 页的锁计数，ISM 总是 0
    pub fn lock_count(&self, idx: usize) -> u16 {
        self.kind.locks()
            .and_then(|locks| locks.get(idx))
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// 钉住数组的代数，每销毁一次加一
    pub fn generation(&self) -> u64 {
        self.cache.lock().generation()
    }

    pub fn has_pin_array(&self) -> bool {
        self.cache.lock().has_array()
    }

    pub fn cache_flags(&self) -> CacheFlags {
        self.cache.lock().flags()
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// 引擎锁当前是否被持有（诊断用）
    pub fn engine_is_locked(&self) -> bool {
        self.mlock.is_locked()
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.freed.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.free() {
            log::warn!("spt: segment dropped without free: {}", err);
        }
    }
}

impl core::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("realsize", &self.realsize)
            .field("szc", &self.szc)
            .field("amp", &self.amp)
            .field("attached", &self.attachments())
            .finish()
    }
}
