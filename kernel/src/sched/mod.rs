//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度器接口
//!
//! 共享段管理只需要调度器提供四件事：
//! - 让出 CPU（等待条件变量、等待软锁清空）
//! - 当前时钟滴答数与时钟频率（有界等待）
//! - 当前线程是否有待处理的信号（可中断等待）
//!
//! 真正的调度器在外部，通过 `Scheduler` trait 接入。

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::SCHED_HZ;

/// 调度器钩子
pub trait Scheduler: Send + Sync {
    /// 让出 CPU
    fn yield_now(&self);

    /// 当前时钟滴答数（单调递增）
    fn ticks(&self) -> u64;

    /// 每秒滴答数
    fn hz(&self) -> u64 {
        SCHED_HZ
    }

    /// 当前线程是否有待处理的信号
    fn signal_pending(&self) -> bool;
}

/// 忙等调度器
///
/// 没有外部调度器时使用：每次让出计一个滴答，信号由 `raise_signal` 模拟。
#[derive(Debug, Default)]
pub struct SpinScheduler {
    ticks: AtomicU64,
    signal: AtomicBool,
}

impl SpinScheduler {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            signal: AtomicBool::new(false),
        }
    }

    /// 标记有待处理的信号
    pub fn raise_signal(&self) {
        self.signal.store(true, Ordering::Release);
    }

    pub fn clear_signal(&self) {
        self.signal.store(false, Ordering::Release);
    }
}

impl Scheduler for SpinScheduler {
    fn yield_now(&self) {
        core::hint::spin_loop();
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::Acquire)
    }
}
