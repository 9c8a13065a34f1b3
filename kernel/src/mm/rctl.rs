//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 锁定内存配额 (resource control)
//!
//! 被 mlock 的字节数按项目 (project) 记账，超过上限时拒绝锁定。
//! 调用方必须先持有段的引擎锁再进入账本。

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::errno::SptError;

/// 项目标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProjectId(pub u32);

/// 锁定内存账本
pub trait Ledger: Send + Sync {
    /// 记入 `bytes`，超出上限时返回 `ResourceExhausted` 且不改变账目
    fn incr_locked_mem(&self, project: ProjectId, bytes: usize) -> Result<(), SptError>;

    /// 归还 `bytes`
    fn decr_locked_mem(&self, project: ProjectId, bytes: usize);
}

#[derive(Debug, Clone, Copy)]
struct Usage {
    locked: usize,
    limit: usize,
}

impl Default for Usage {
    fn default() -> Self {
        Self { locked: 0, limit: usize::MAX }
    }
}

/// 按项目记账的实现
#[derive(Default)]
pub struct ProjectLedger {
    projects: Mutex<BTreeMap<ProjectId, Usage>>,
}

impl ProjectLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置项目的上限（字节）
    pub fn set_limit(&self, project: ProjectId, limit: usize) {
        self.projects.lock().entry(project).or_default().limit = limit;
    }

    /// 项目当前已记入的字节数
    pub fn usage(&self, project: ProjectId) -> usize {
        self.projects.lock().get(&project).map(|u| u.locked).unwrap_or(0)
    }
}

impl Ledger for ProjectLedger {
    fn incr_locked_mem(&self, project: ProjectId, bytes: usize) -> Result<(), SptError> {
        if bytes == 0 {
            return Ok(());
        }
        let mut projects = self.projects.lock();
        let usage = projects.entry(project).or_default();
        let total = usage.locked.checked_add(bytes).ok_or(SptError::ResourceExhausted)?;
        if total > usage.limit {
            log::debug!("rctl: {:?} over limit ({} + {} > {})",
                        project, usage.locked, bytes, usage.limit);
            return Err(SptError::ResourceExhausted);
        }
        usage.locked = total;
        Ok(())
    }

    fn decr_locked_mem(&self, project: ProjectId, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let mut projects = self.projects.lock();
        let usage = projects.entry(project).or_default();
        if usage.locked < bytes {
            log::error!("rctl: {:?} refund {} exceeds usage {}", project, bytes, usage.locked);
            usage.locked = 0;
        } else {
            usage.locked -= bytes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_and_refund() {
        let ledger = ProjectLedger::new();
        let proj = ProjectId(7);
        ledger.incr_locked_mem(proj, 4096).unwrap();
        ledger.incr_locked_mem(proj, 8192).unwrap();
        assert_eq!(ledger.usage(proj), 12288);
        ledger.decr_locked_mem(proj, 12288);
        assert_eq!(ledger.usage(proj), 0);
    }

    #[test]
    fn test_limit_rejects_without_change() {
        let ledger = ProjectLedger::new();
        let proj = ProjectId(1);
        ledger.set_limit(proj, 8192);
        ledger.incr_locked_mem(proj, 4096).unwrap();
        assert_eq!(ledger.incr_locked_mem(proj, 8192), Err(SptError::ResourceExhausted));
        assert_eq!(ledger.usage(proj), 4096);
        // 其他项目不受影响
        ledger.incr_locked_mem(ProjectId(2), 1 << 30).unwrap();
    }
}
