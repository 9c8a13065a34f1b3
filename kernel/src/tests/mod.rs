//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 共享段场景测试
//!
//! 单元测试放在各模块自己的 `tests` 子模块里；这里是跨模块的场景：
//! 生命周期、锁定、钉住缓存、缺页竞争、锁顺序，以及 proptest 性质测试。
//!
//! 运行测试：
//! ```bash
//! cargo test --package rux-spt
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::SCHED_HZ;
use crate::mm::anon::AnonStore;
use crate::mm::hat::{AsId, SoftHat};
use crate::mm::page::VirtAddr;
use crate::mm::rctl::{Ledger, ProjectLedger};
use crate::mm::spt::{Attachment, Collaborators, SegMode, SegmentConfig, SharedSegment, SptContext};
use crate::mm::vmtask::TaskDispatcher;
use crate::sched::Scheduler;

pub mod fault;
pub mod lock;

/// 附着基址，按最大页大小对齐
pub const BASE: usize = 0x4000_0000;

/// 基于墙钟的调度器，滴答由经过的时间换算
pub struct StdScheduler {
    start: Instant,
    signal: AtomicBool,
}

impl StdScheduler {
    pub fn new() -> Self {
        Self { start: Instant::now(), signal: AtomicBool::new(false) }
    }

    pub fn raise_signal(&self) {
        self.signal.store(true, Ordering::Release);
    }
}

impl Scheduler for StdScheduler {
    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn ticks(&self) -> u64 {
        let ms = self.start.elapsed().as_millis() as u64;
        ms * SCHED_HZ / 1000
    }

    fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::Acquire)
    }
}

/// 每个作业一个线程
pub struct ThreadDispatcher;

impl TaskDispatcher for ThreadDispatcher {
    fn dispatch(&self, njobs: usize, job: &(dyn Fn(usize) + Sync)) {
        std::thread::scope(|s| {
            for i in 0..njobs {
                s.spawn(move || job(i));
            }
        });
    }
}

/// 测试环境
pub struct Fixture {
    pub store: Arc<AnonStore>,
    pub hat: Arc<SoftHat>,
    pub ledger: Arc<ProjectLedger>,
    /// 线程化环境使用的调度器
    pub sched: Arc<StdScheduler>,
    pub ctx: Arc<SptContext>,
}

impl Fixture {
    /// 串行分发、忙等调度器
    pub fn new(pages: usize) -> Self {
        Self::build(pages, None, false)
    }

    /// 线程分发、墙钟调度器
    pub fn threaded(pages: usize) -> Self {
        Self::build(pages, None, true)
    }

    /// 使用自定义账本
    pub fn with_ledger(pages: usize, ledger: Arc<dyn Ledger>) -> Self {
        Self::build(pages, Some(ledger), false)
    }

    pub fn threaded_with_ledger(pages: usize, ledger: Arc<dyn Ledger>) -> Self {
        Self::build(pages, Some(ledger), true)
    }

    fn build(pages: usize, ledger: Option<Arc<dyn Ledger>>, threaded: bool) -> Self {
        let store = Arc::new(AnonStore::new(pages));
        let hat = Arc::new(SoftHat::new());
        let sched = Arc::new(StdScheduler::new());
        let project_ledger = Arc::new(ProjectLedger::new());
        let ledger: Arc<dyn Ledger> = match ledger {
            Some(ledger) => ledger,
            None => project_ledger.clone(),
        };
        let mut collab = Collaborators::new(store.clone(), hat.clone()).with_ledger(ledger);
        if threaded {
            collab = collab.with_dispatcher(Arc::new(ThreadDispatcher))
                .with_scheduler(sched.clone());
        }
        let ctx = SptContext::new(collab);
        Self { store, hat, ledger: project_ledger, sched, ctx }
    }

    pub fn segment(&self, size: usize, mode: SegMode) -> Arc<SharedSegment> {
        SharedSegment::create(&self.ctx, SegmentConfig::new(size, mode)).unwrap()
    }

    pub fn attach(&self, seg: &Arc<SharedSegment>, asid: u32) -> Attachment {
        Attachment::attach(seg, AsId(asid), VirtAddr::new(BASE)).unwrap()
    }
}

/// 附着地址加页偏移
pub fn va(page: usize) -> VirtAddr {
    VirtAddr::new(BASE + page * crate::mm::page::PAGE_SIZE)
}
