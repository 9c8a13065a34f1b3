//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 共享页表段 (Shared Page Table)
//!
//! 结构：
//! ```text
//! SptContext ──< SharedSegment ──< Attachment（每个地址空间一个）
//!                     │
//!                     ├── PinCache ── PinArray（所有附着者共享的钉住页数组）
//!                     └── 锁计数数组（DISM / OSM）
//! ```
//!
//! 附着者通过 `Arc` 持有段，段不反向引用附着者。
//! 钉住缓存的每个条目持有其附着者的 `SoftLocks`，
//! 条目回收时在附着者的拆除屏障下递减软锁计数。
//!
//! 锁顺序（由外到内）：
//! 1. 粒度读写锁 (`mcglock`，仅 OSM 粒度操作)
//! 2. 引擎锁 (`mlock`，锁计数和配额)
//! 3. 缓存锁 (`spt_lock`，钉住缓存)
//! 4. 账本锁、常驻内存锁、附着者的拆除屏障

pub mod fault;
pub mod lockop;
pub mod pcache;
pub mod segment;
pub mod shm;

pub use pcache::{CacheFlags, PinArray, PinHandle};
pub use segment::{
    Collaborators, LockCounts, SegKind, SegMode, SegmentConfig, SharedSegment, SptContext,
    SptStats,
};
pub use shm::{Advice, Attachment, Incore, SegCap, SegType, SoftLocks};

/// 访问类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegRw {
    Read,
    Write,
    Exec,
}

/// 缺页类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// 装入映射，不保留钉住
    Invalidate,
    /// 装入并锁定映射，页保持钉住直到 SoftUnlock
    SoftLock,
    /// 撤销 SoftLock
    SoftUnlock,
    /// 保护位检查
    ProtectionCheck,
}

/// 锁定操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    /// mlock
    Lock,
    /// munlock
    Unlock,
    /// 按粒度锁定 (OSM)
    LockGranule,
    /// 按粒度解锁并释放内存 (OSM)
    UnlockGranule,
}

impl LockOp {
    pub fn is_granule(&self) -> bool {
        matches!(self, LockOp::LockGranule | LockOp::UnlockGranule)
    }

    pub fn is_lock(&self) -> bool {
        matches!(self, LockOp::Lock | LockOp::LockGranule)
    }
}
