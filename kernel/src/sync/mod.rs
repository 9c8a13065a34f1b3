//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 同步原语 (Synchronization Primitives)
//!
//! - 自旋互斥锁、读写锁、一次性初始化：直接使用 `spin`
//! - 条件变量：基于序号的实现，等待时通过 `Scheduler` 让出 CPU
//!
//! 锁顺序（共享段）：
//! 粒度读写锁 -> 引擎互斥锁 -> 页缓存互斥锁 -> 配额账本 / 驻留内存计数

pub mod condvar;

pub use condvar::{CondVar, WaitResult};
pub use spin::{Mutex, MutexGuard, Once, RwLock, RwLockReadGuard, RwLockWriteGuard};
