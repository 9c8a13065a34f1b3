//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内存分配策略
//!
//! 记录匿名对象各个范围的分配策略（本地优先、随机、轮转等）。
//! 后设置的范围覆盖先设置的。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use super::anon::AnonMapId;

/// 内存分配策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemPolicy {
    /// 系统默认
    #[default]
    Default,
    /// 在首次访问的节点上分配
    NextTouch,
    /// 在访问线程所在 CPU 的节点上分配
    NextCpu,
    /// 随机分布
    Random,
    /// 轮转分布
    RoundRobin,
}

/// 策略接口
pub trait PolicyAdvisor: Send + Sync {
    /// 设置 `[idx, idx + npages)` 的策略；完全相同的设置已存在时返回 true
    fn set_policy(&self, amp: AnonMapId, idx: usize, npages: usize, policy: MemPolicy) -> bool;

    /// 查询某页的策略
    fn get_policy(&self, amp: AnonMapId, idx: usize) -> Option<MemPolicy>;

    /// 匿名对象释放时丢弃其全部策略
    fn forget(&self, _amp: AnonMapId) {}
}

#[derive(Debug, Clone, Copy)]
struct PolicyRange {
    start: usize,
    end: usize,
    policy: MemPolicy,
}

/// 按范围记录的策略表
#[derive(Default)]
pub struct PolicyTable {
    ranges: Mutex<BTreeMap<AnonMapId, Vec<PolicyRange>>>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PolicyAdvisor for PolicyTable {
    fn set_policy(&self, amp: AnonMapId, idx: usize, npages: usize, policy: MemPolicy) -> bool {
        let mut ranges = self.ranges.lock();
        let list = ranges.entry(amp).or_default();
        let end = idx + npages;
        if let Some(last) = list.last() {
            if last.start == idx && last.end == end && last.policy == policy {
                return true;
            }
        }
        list.push(PolicyRange { start: idx, end, policy });
        false
    }

    fn get_policy(&self, amp: AnonMapId, idx: usize) -> Option<MemPolicy> {
        let ranges = self.ranges.lock();
        ranges.get(&amp)?
            .iter()
            .rev()
            .find(|r| r.start <= idx && idx < r.end)
            .map(|r| r.policy)
    }

    fn forget(&self, amp: AnonMapId) {
        self.ranges.lock().remove(&amp);
    }
}
