//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 页大小等级与对齐运算
//!
//! 共享段的所有范围计算都经过这里：
//! - 2 的幂对齐（向下对齐、向上取整、相位）
//! - 字节与页号互转（btop / btopr / ptob）
//! - 页大小等级 `Szc`，对应 `PAGE_SIZES` 中的下标

use crate::config::{PAGE_SIZES, SHARE_MIN_PAGE_SIZE};

pub use crate::config::{PAGE_SHIFT, PAGE_SIZE};

pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// 支持的页大小等级数量
pub const NUM_PAGE_SIZES: usize = PAGE_SIZES.len();

// ========== 2 的幂运算 ==========

/// 向下对齐到 `align`（必须是 2 的幂）
#[inline]
pub const fn p2align(x: usize, align: usize) -> usize {
    x & !(align - 1)
}

/// 向上取整到 `align`（必须是 2 的幂）
#[inline]
pub const fn p2roundup(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

/// `x` 在 `align` 边界内的偏移
#[inline]
pub const fn p2phase(x: usize, align: usize) -> usize {
    x & (align - 1)
}

#[inline]
pub const fn is_p2aligned(x: usize, align: usize) -> bool {
    p2phase(x, align) == 0
}

#[inline]
pub const fn is_power_of_two(x: usize) -> bool {
    x != 0 && (x & (x - 1)) == 0
}

// ========== 字节与页号 ==========

/// 字节数转页数（向下取整）
#[inline]
pub const fn btop(bytes: usize) -> usize {
    bytes >> PAGE_SHIFT
}

/// 字节数转页数（向上取整）
#[inline]
pub const fn btopr(bytes: usize) -> usize {
    (bytes + PAGE_MASK) >> PAGE_SHIFT
}

/// 页数转字节数
#[inline]
pub const fn ptob(pages: usize) -> usize {
    pages << PAGE_SHIFT
}

/// 把 `[start, start+len)` 向外扩展到 `align` 边界
///
/// 返回 `(对齐后的起点, 对齐后的长度)`
#[inline]
pub const fn align_span(start: usize, len: usize, align: usize) -> (usize, usize) {
    let a_start = p2align(start, align);
    let a_len = p2roundup(start + len - a_start, align);
    (a_start, a_len)
}

// ========== 虚拟地址 ==========

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn is_aligned(&self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    pub const fn floor(&self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    pub const fn ceil(&self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    pub const fn add(&self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// 相对 `base` 的页下标，`self < base` 时返回 None
    pub const fn page_index_from(&self, base: VirtAddr) -> Option<usize> {
        if self.0 < base.0 {
            None
        } else {
            Some(btop(self.0 - base.0))
        }
    }
}

// ========== 页大小等级 ==========

/// 页大小等级 (size code)
///
/// `Szc(0)` 是基础页，`Szc(n)` 对应 `PAGE_SIZES[n]`
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Szc(u8);

impl Szc {
    /// 基础页
    pub const BASE: Szc = Szc(0);

    pub const fn new(code: u8) -> Option<Self> {
        if (code as usize) < NUM_PAGE_SIZES {
            Some(Self(code))
        } else {
            None
        }
    }

    /// 最大支持的等级
    pub const fn max() -> Self {
        Self((NUM_PAGE_SIZES - 1) as u8)
    }

    /// 精确匹配某个页大小
    pub fn from_size(size: usize) -> Option<Self> {
        PAGE_SIZES.iter()
            .position(|&s| s == size)
            .map(|i| Self(i as u8))
    }

    /// 共享映射允许的最小等级
    pub fn share_min() -> Self {
        Self::from_size(SHARE_MIN_PAGE_SIZE).unwrap_or(Self::BASE)
    }

    pub const fn code(&self) -> u8 {
        self.0
    }

    /// 该等级的页大小（字节）
    pub const fn size(&self) -> usize {
        PAGE_SIZES[self.0 as usize]
    }

    /// 该等级包含的基础页数
    pub const fn pagecnt(&self) -> usize {
        btop(self.size())
    }

    pub const fn smaller(&self) -> Option<Self> {
        if self.0 == 0 {
            None
        } else {
            Some(Self(self.0 - 1))
        }
    }

    pub const fn larger(&self) -> Option<Self> {
        if (self.0 as usize) + 1 < NUM_PAGE_SIZES {
            Some(Self(self.0 + 1))
        } else {
            None
        }
    }

    /// 页大小不超过 `size` 且 `addr` 按其对齐的最大等级
    pub fn largest_fitting(addr: usize, size: usize, limit: Szc) -> Self {
        let mut szc = limit;
        while szc.0 > 0 && (szc.size() > size || !is_p2aligned(addr, szc.size())) {
            szc = Self(szc.0 - 1);
        }
        szc
    }
}
