//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! Rux 共享页表段 (SPT)
//!
//! 多个地址空间共享同一组物理页和同一份页表：
//! - ISM：创建时全部分配并永久锁定
//! - DISM：可换页，按页 mlock
//! - OSM：按粒度锁定，锁定与进程无关
//!
//! 物理页分配、地址转换、匿名内存和调度器都在外部，
//! 通过 `mm::anon`、`mm::hat`、`mm::rctl`、`mm::policy`、`sched`
//! 中的 trait 接入；这些模块同时提供内存中的参考实现。

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod errno;
pub mod mm;
pub mod sched;
pub mod sync;

#[cfg(test)]
mod tests;

pub use errno::{Errno, SptError};
pub use mm::spt::{
    Advice, Attachment, Collaborators, FaultKind, LockOp, PinHandle, SegCap, SegMode, SegRw,
    SegType, SegmentConfig, SharedSegment, SptContext, SptStats,
};
