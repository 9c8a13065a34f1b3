//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 页描述符 (Page Descriptor)
//!
//! 共享段通过 `PageRef`（`Arc<Page>`）持有物理页，描述符维护：
//! - 页标志位 (flags)
//! - 共享/独占钉住计数（对应 SE_SHARED / SE_EXCL 页锁）
//! - mlock 计数 (p_lckcnt)
//! - 大页等级与在匿名对象中的下标
//!

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::page::{is_p2aligned, p2align, Szc};

/// 页标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageFlag {
    /// 页已被访问
    Referenced = 1 << 0,
    /// 页已修改
    Dirty = 1 << 1,
    /// 大页的根页
    Head = 1 << 2,
    /// 匿名页
    Anonymous = 1 << 3,
}

/// 页标志位集合
#[derive(Debug, Default)]
pub struct PageFlags(AtomicU32);

impl PageFlags {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn raw(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn test(&self, flag: PageFlag) -> bool {
        self.0.load(Ordering::Relaxed) & (flag as u32) != 0
    }

    pub fn set(&self, flag: PageFlag) {
        self.0.fetch_or(flag as u32, Ordering::Release);
    }

    pub fn clear(&self, flag: PageFlag) {
        self.0.fetch_and(!(flag as u32), Ordering::Release);
    }
}

/// 页描述符
pub struct Page {
    /// 物理页号
    pfn: usize,
    /// 在所属匿名对象中的页下标
    index: usize,
    /// 所属大页的等级
    szc: Szc,
    flags: PageFlags,
    /// 共享钉住计数
    share_pins: AtomicU32,
    /// 独占钉住
    excl: AtomicBool,
    /// mlock 计数
    lckcnt: AtomicU32,
}

/// 共享页句柄
pub type PageRef = Arc<Page>;

impl Page {
    pub fn new(pfn: usize, index: usize, szc: Szc) -> Self {
        let page = Self {
            pfn,
            index,
            szc,
            flags: PageFlags::new(),
            share_pins: AtomicU32::new(0),
            excl: AtomicBool::new(false),
            lckcnt: AtomicU32::new(0),
        };
        page.flags.set(PageFlag::Anonymous);
        if is_p2aligned(index, szc.pagecnt()) {
            page.flags.set(PageFlag::Head);
        }
        page
    }

    pub fn pfn(&self) -> usize {
        self.pfn
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn szc(&self) -> Szc {
        self.szc
    }

    /// 是否为大页的根页（基础页总是根页）
    pub fn is_root(&self) -> bool {
        self.flags.test(PageFlag::Head)
    }

    /// 所属大页根页的下标
    pub fn root_index(&self) -> usize {
        p2align(self.index, self.szc.pagecnt())
    }

    // ========== 钉住 ==========

    /// 共享钉住 (SE_SHARED)
    pub fn pin_shared(&self) {
        self.share_pins.fetch_add(1, Ordering::AcqRel);
    }

    /// 尝试独占钉住，已有任何持有者时失败
    pub fn try_pin_excl(&self) -> bool {
        if self.share_pins.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.excl
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 独占降级为共享
    pub fn downgrade(&self) {
        if self.excl.swap(false, Ordering::AcqRel) {
            self.share_pins.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn is_excl(&self) -> bool {
        self.excl.load(Ordering::Acquire)
    }

    /// 释放一次钉住（独占优先）
    ///
    /// 没有任何钉住时返回 false
    pub fn unpin(&self) -> bool {
        if self.excl.swap(false, Ordering::AcqRel) {
            return true;
        }
        let released = self.share_pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !released {
            log::error!("page: unpin of unpinned page pfn={:#x}", self.pfn);
        }
        released
    }

    /// 当前共享钉住数
    pub fn pin_count(&self) -> u32 {
        self.share_pins.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() != 0 || self.is_excl()
    }

    // ========== mlock 计数 ==========

    pub fn lckcnt(&self) -> u32 {
        self.lckcnt.load(Ordering::Acquire)
    }

    /// mlock 计数加一，已达 `max` 时失败
    pub fn inc_lckcnt(&self, max: u32) -> Option<u32> {
        self.lckcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n >= max { None } else { Some(n + 1) }
            })
            .ok()
            .map(|old| old + 1)
    }

    /// mlock 计数减一，返回新值
    pub fn dec_lckcnt(&self) -> Option<u32> {
        self.lckcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|old| old - 1)
    }

    // ========== 访问位 ==========

    pub fn set_ref(&self) {
        self.flags.set(PageFlag::Referenced);
    }

    pub fn set_refmod(&self) {
        self.flags.set(PageFlag::Referenced);
        self.flags.set(PageFlag::Dirty);
    }

    pub fn is_referenced(&self) -> bool {
        self.flags.test(PageFlag::Referenced)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.test(PageFlag::Dirty)
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("pfn", &self.pfn)
            .field("index", &self.index)
            .field("szc", &self.szc)
            .field("pins", &self.pin_count())
            .field("lckcnt", &self.lckcnt())
            .finish()
    }
}
