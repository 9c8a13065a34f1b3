//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 地址转换层 (HAT) 接口
//!
//! 共享段把物理页装入自己的内部地址空间，附着的进程通过
//! `share` 共享这段页表，而不是各自装入一份。
//!
//! `SoftHat` 是软件实现：用有序表记录每个地址空间的映射，
//! 供测试观察装入、锁定和共享的效果。

use alloc::collections::BTreeMap;

use bitflags::bitflags;
use spin::Mutex;

use super::page::{btop, ptob, VirtAddr, PAGE_SIZE};
use super::page_desc::PageRef;
use crate::errno::SptError;

bitflags! {
    /// 页保护位
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        const USER  = 1 << 3;
        const ALL   = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits() | Self::USER.bits();
    }
}

bitflags! {
    /// 装入标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HatLoad: u32 {
        /// 映射锁定，直到显式 unlock
        const LOCK  = 1 << 0;
        /// 装入共享页表
        const SHARE = 1 << 1;
    }
}

bitflags! {
    /// 卸载标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HatUnload: u32 {
        /// 同时解除锁定
        const UNLOCK = 1 << 0;
        /// 解除映射
        const UNMAP  = 1 << 1;
    }
}

/// 平台能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HatCap {
    /// ISM 页可以动态解除映射，页无需终生钉住
    DynamicIsmUnmap,
    /// 支持按粒度锁定 (OSM)
    LockGranule,
}

/// 地址空间标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(pub u32);

/// 地址转换层接口
pub trait Hat: Send + Sync {
    /// 从 `addr` 开始连续装入 `pages`
    fn memload_array(
        &self,
        asid: AsId,
        addr: VirtAddr,
        pages: &[PageRef],
        prot: Prot,
        flags: HatLoad,
    ) -> Result<(), SptError>;

    /// 卸载 `[addr, addr + len)`
    fn unload(&self, asid: AsId, addr: VirtAddr, len: usize, flags: HatUnload);

    /// 解除 `[addr, addr + len)` 的锁定
    fn unlock(&self, asid: AsId, addr: VirtAddr, len: usize);

    /// 让 `asid` 在 `addr` 处共享 `seg_as` 的页表
    fn share(&self, asid: AsId, addr: VirtAddr, seg_as: AsId, len: usize) -> Result<(), SptError>;

    /// 取消共享
    fn unshare(&self, asid: AsId, addr: VirtAddr, len: usize);

    fn supported(&self, cap: HatCap) -> bool;
}

/// 一条软件映射
#[derive(Debug, Clone)]
pub struct Translation {
    pub pfn: usize,
    pub prot: Prot,
    /// 锁定次数
    pub locks: u32,
}

#[derive(Debug, Clone, Copy)]
struct ShareRecord {
    seg_as: AsId,
    len: usize,
}

/// 软件地址转换层
pub struct SoftHat {
    /// (地址空间, 虚页号) -> 映射
    ptes: Mutex<BTreeMap<(AsId, usize), Translation>>,
    /// (地址空间, 起始地址) -> 共享记录
    shares: Mutex<BTreeMap<(AsId, usize), ShareRecord>>,
    dynamic_ism_unmap: bool,
    lock_granule: bool,
}

impl SoftHat {
    pub fn new() -> Self {
        Self::with_caps(true, true)
    }

    pub fn with_caps(dynamic_ism_unmap: bool, lock_granule: bool) -> Self {
        Self {
            ptes: Mutex::new(BTreeMap::new()),
            shares: Mutex::new(BTreeMap::new()),
            dynamic_ism_unmap,
            lock_granule,
        }
    }

    /// 查询一条映射
    pub fn translation(&self, asid: AsId, addr: VirtAddr) -> Option<Translation> {
        self.ptes.lock().get(&(asid, btop(addr.as_usize()))).cloned()
    }

    /// 地址空间中已装入的页数
    pub fn mapped_pages(&self, asid: AsId) -> usize {
        self.ptes.lock().keys().filter(|(a, _)| *a == asid).count()
    }

    /// 地址空间中仍被锁定的页数
    pub fn locked_pages(&self, asid: AsId) -> usize {
        self.ptes.lock().iter()
            .filter(|((a, _), t)| *a == asid && t.locks > 0)
            .count()
    }

    /// `asid` 在 `addr` 处共享的段地址空间
    pub fn shared_with(&self, asid: AsId, addr: VirtAddr) -> Option<AsId> {
        self.shares.lock().get(&(asid, addr.as_usize())).map(|r| r.seg_as)
    }

    pub fn share_count(&self) -> usize {
        self.shares.lock().len()
    }
}

impl Default for SoftHat {
    fn default() -> Self {
        Self::new()
    }
}

impl Hat for SoftHat {
    fn memload_array(
        &self,
        asid: AsId,
        addr: VirtAddr,
        pages: &[PageRef],
        prot: Prot,
        flags: HatLoad,
    ) -> Result<(), SptError> {
        if !addr.is_aligned() {
            return Err(SptError::ConfigError);
        }
        let mut ptes = self.ptes.lock();
        let vpn = btop(addr.as_usize());
        for (i, page) in pages.iter().enumerate() {
            let pte = ptes.entry((asid, vpn + i)).or_insert(Translation {
                pfn: page.pfn(),
                prot,
                locks: 0,
            });
            pte.pfn = page.pfn();
            pte.prot = prot;
            if flags.contains(HatLoad::LOCK) {
                pte.locks += 1;
            }
        }
        Ok(())
    }

    fn unload(&self, asid: AsId, addr: VirtAddr, len: usize, flags: HatUnload) {
        let mut ptes = self.ptes.lock();
        let start = btop(addr.as_usize());
        let end = start + btop(len + PAGE_SIZE - 1);
        for vpn in start..end {
            let remove = match ptes.get_mut(&(asid, vpn)) {
                None => false,
                Some(pte) => {
                    if flags.contains(HatUnload::UNLOCK) {
                        pte.locks = pte.locks.saturating_sub(1);
                    }
                    flags.contains(HatUnload::UNMAP) || pte.locks == 0
                }
            };
            if remove {
                ptes.remove(&(asid, vpn));
            }
        }
    }

    fn unlock(&self, asid: AsId, addr: VirtAddr, len: usize) {
        let mut ptes = self.ptes.lock();
        let start = btop(addr.as_usize());
        for vpn in start..start + btop(len + PAGE_SIZE - 1) {
            if let Some(pte) = ptes.get_mut(&(asid, vpn)) {
                pte.locks = pte.locks.saturating_sub(1);
            }
        }
    }

    fn share(&self, asid: AsId, addr: VirtAddr, seg_as: AsId, len: usize) -> Result<(), SptError> {
        let mut shares = self.shares.lock();
        if shares.contains_key(&(asid, addr.as_usize())) {
            return Err(SptError::Busy);
        }
        shares.insert((asid, addr.as_usize()), ShareRecord { seg_as, len });
        log::debug!("hat: {:?} shares {:?} at {:#x} ({} pages)",
                    asid, seg_as, addr.as_usize(), btop(len));
        Ok(())
    }

    fn unshare(&self, asid: AsId, addr: VirtAddr, len: usize) {
        let mut shares = self.shares.lock();
        match shares.remove(&(asid, addr.as_usize())) {
            Some(record) if record.len != len => {
                log::warn!("hat: unshare length {:#x} differs from share {:#x}", len, record.len);
            }
            Some(_) => {}
            None => log::warn!("hat: unshare of unknown range {:#x}", addr.as_usize()),
        }
    }

    fn supported(&self, cap: HatCap) -> bool {
        match cap {
            HatCap::DynamicIsmUnmap => self.dynamic_ism_unmap,
            HatCap::LockGranule => self.lock_granule,
        }
    }
}

/// 把页下标换算成段内部地址空间的地址
#[inline]
pub fn seg_addr(idx: usize) -> VirtAddr {
    VirtAddr::new(ptob(idx))
}
