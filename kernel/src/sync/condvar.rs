//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 条件变量 (Condition Variable)
//!
//! 参考：
//! - `kernel/sched/wait.c` - 等待操作
//! - `pthread_cond_t` - POSIX 条件变量
//!
//! 核心概念：
//! - 必须与互斥锁配合使用
//! - wait_timeout_sig() 释放锁并等待唤醒，返回前重新获取锁
//! - broadcast() 唤醒所有等待者
//!
//! 实现：每次唤醒把序号加一，等待者在释放锁之前记下序号，
//! 之后只要序号变化就认为被唤醒，因此不会丢失唤醒。
//! 允许虚假唤醒，调用方必须在循环里重新检查条件。

use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::sched::Scheduler;

/// 有界等待的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// 被唤醒
    Signaled,
    /// 超时
    TimedOut,
    /// 被信号中断
    Interrupted,
}

/// 条件变量
#[derive(Debug, Default)]
pub struct CondVar {
    seq: AtomicU64,
}

impl CondVar {
    pub const fn new() -> Self {
        Self { seq: AtomicU64::new(0) }
    }

    /// 等待唤醒，直到滴答数到达 `deadline` 或有信号到来
    ///
    /// 对应 `cv_timedwait_sig()`
    pub fn wait_timeout_sig<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
        deadline: u64,
        sched: &dyn Scheduler,
    ) -> (MutexGuard<'a, T>, WaitResult) {
        let seq = self.seq.load(Ordering::Acquire);
        drop(guard);

        let result = loop {
            if self.seq.load(Ordering::Acquire) != seq {
                break WaitResult::Signaled;
            }
            if sched.signal_pending() {
                break WaitResult::Interrupted;
            }
            if sched.ticks() >= deadline {
                break WaitResult::TimedOut;
            }
            sched.yield_now();
        };

        (mutex.lock(), result)
    }

    /// 唤醒所有等待者
    pub fn broadcast(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::SpinScheduler;

    #[test]
    fn test_timeout() {
        let sched = SpinScheduler::new();
        let mutex = Mutex::new(0u32);
        let cv = CondVar::new();
        let deadline = sched.ticks() + 5;
        let (guard, result) = cv.wait_timeout_sig(&mutex, mutex.lock(), deadline, &sched);
        assert_eq!(result, WaitResult::TimedOut);
        assert_eq!(*guard, 0);
    }

    #[test]
    fn test_interrupted() {
        let sched = SpinScheduler::new();
        sched.raise_signal();
        let mutex = Mutex::new(());
        let cv = CondVar::new();
        let (_guard, result) = cv.wait_timeout_sig(&mutex, mutex.lock(), u64::MAX, &sched);
        assert_eq!(result, WaitResult::Interrupted);
    }

    #[test]
    fn test_broadcast_wakes_waiter() {
        use alloc::sync::Arc;
        use std::thread;

        let sched = Arc::new(SpinScheduler::new());
        let state = Arc::new((Mutex::new(false), CondVar::new()));

        let waiter = {
            let state = state.clone();
            let sched = sched.clone();
            thread::spawn(move || {
                let (mutex, cv) = &*state;
                let mut guard = mutex.lock();
                while !*guard {
                    let (next, _) = cv.wait_timeout_sig(mutex, guard, u64::MAX, &*sched);
                    guard = next;
                }
            })
        };

        {
            let (mutex, cv) = &*state;
            *mutex.lock() = true;
            cv.broadcast();
        }
        waiter.join().unwrap();
    }
}
