//! Rux SPT 配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// 基本信息
// ============================================================

/// 名称
pub const KERNEL_NAME: &str = "Rux-SPT";

/// 版本
pub const KERNEL_VERSION: &str = "0.1.0";

// ============================================================
// 内存配置
// ============================================================

/// 页大小
pub const PAGE_SIZE: usize = 4096;

/// 页大小位移
pub const PAGE_SHIFT: usize = 12;

/// 支持的页大小等级（从小到大）
pub const PAGE_SIZES: [usize; 4] = [4096, 65536, 524288, 4194304];

/// 共享映射的最小页大小
pub const SHARE_MIN_PAGE_SIZE: usize = 65536;

/// 默认共享页大小等级
pub const DEFAULT_SHARE_SZC: u8 = 1;

// ============================================================
// SPT 配置
// ============================================================

/// 每页锁计数上限
pub const DISM_LOCK_MAX: u16 = 65534;

/// 粒度解锁等待页缓存清空的最长时间（秒）
pub const SPT_PCACHE_WAIT_SECS: u64 = 120;

/// 丢弃附着时等待异步 I/O 完成的最长时间（时钟滴答）
pub const SPT_DETACH_WAIT_TICKS: u64 = 10;

/// minfree 除数
pub const MINFREE_DIVISOR: usize = 20;

// ============================================================
// 并行任务配置
// ============================================================

/// 小页作业最小分块
pub const VMTASK_SPGS_MINJOB: usize = 512;

/// 大页作业最小分块
pub const VMTASK_LPGS_MINJOB: usize = 4;

/// 单个作业最大任务数
pub const VMTASK_MAX_TASKS: usize = 8;

// ============================================================
// 调度器配置
// ============================================================

/// 时钟频率（滴答/秒）
pub const SCHED_HZ: u64 = 100;
