//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 原子位图
//!
//! 用于附着的逐页锁定位图，以及调用方传入的锁定结果位图。
//! 多个并行任务会同时置位，所以每个字都是原子的。

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

const BITS: usize = 64;

pub struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl AtomicBitmap {
    /// 创建 `len` 位的全零位图
    pub fn new(len: usize) -> Self {
        let nwords = (len + BITS - 1) / BITS;
        let words: Vec<AtomicU64> = (0..nwords).map(|_| AtomicU64::new(0)).collect();
        Self { words: words.into_boxed_slice(), len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn slot(&self, bit: usize) -> Option<(&AtomicU64, u64)> {
        if bit >= self.len {
            return None;
        }
        Some((&self.words[bit / BITS], 1u64 << (bit % BITS)))
    }

    pub fn test(&self, bit: usize) -> bool {
        match self.slot(bit) {
            Some((word, mask)) => word.load(Ordering::Acquire) & mask != 0,
            None => false,
        }
    }

    /// 置位，返回旧值
    pub fn set(&self, bit: usize) -> bool {
        match self.slot(bit) {
            Some((word, mask)) => word.fetch_or(mask, Ordering::AcqRel) & mask != 0,
            None => false,
        }
    }

    /// 清位，返回旧值
    pub fn clear(&self, bit: usize) -> bool {
        match self.slot(bit) {
            Some((word, mask)) => word.fetch_and(!mask, Ordering::AcqRel) & mask != 0,
            None => false,
        }
    }

    /// 已置位的数量
    pub fn count_ones(&self) -> usize {
        self.words.iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// 深拷贝
    pub fn snapshot(&self) -> Self {
        let words: Vec<AtomicU64> = self.words.iter()
            .map(|w| AtomicU64::new(w.load(Ordering::Acquire)))
            .collect();
        Self { words: words.into_boxed_slice(), len: self.len }
    }
}

impl core::fmt::Debug for AtomicBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AtomicBitmap")
            .field("len", &self.len)
            .field("set", &self.count_ones())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear() {
        let map = AtomicBitmap::new(130);
        assert!(!map.set(0));
        assert!(map.set(0));
        assert!(!map.set(129));
        assert!(map.test(129));
        assert_eq!(map.count_ones(), 2);
        assert!(map.clear(0));
        assert!(!map.test(0));
        // 越界访问被忽略
        assert!(!map.set(130));
        assert!(!map.test(130));
    }

    #[test]
    fn test_snapshot_is_independent() {
        let map = AtomicBitmap::new(16);
        map.set(3);
        let copy = map.snapshot();
        map.clear(3);
        assert!(copy.test(3));
        assert!(!map.test(3));
    }
}
