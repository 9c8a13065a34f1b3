//! Rux SPT 构建脚本
//!
//! 这个脚本在编译前运行，负责：
//! 1. 解析 Kernel.toml 配置文件
//! 2. 校验页大小等级
//! 3. 生成 src/config.rs

use std::env;
use std::fs;
use std::path::PathBuf;

/// 读取 `[section] key` 整数，缺失时使用默认值
fn int_of(config: &toml::Value, section: &str, key: &str, default: i64) -> i64 {
    config.get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_integer())
        .unwrap_or(default)
}

/// 读取页大小等级数组
fn page_sizes_of(config: &toml::Value, page_size: i64) -> Vec<i64> {
    let sizes: Vec<i64> = config.get("memory")
        .and_then(|m| m.get("page_sizes"))
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_integer()).collect())
        .unwrap_or_else(|| vec![page_size, 65536, 524288, 4194304]);

    // 等级必须从基础页开始，严格递增且都是 2 的幂
    assert!(!sizes.is_empty(), "page_sizes 不能为空");
    assert_eq!(sizes[0], page_size, "page_sizes[0] 必须等于 page_size");
    for pair in sizes.windows(2) {
        assert!(pair[0] < pair[1], "page_sizes 必须严格递增");
    }
    for size in &sizes {
        assert!(*size > 0 && (*size & (*size - 1)) == 0, "页大小必须是 2 的幂: {}", size);
    }
    sizes
}

fn main() {
    println!("cargo:rerun-if-changed=../Kernel.toml");
    println!("cargo:rerun-if-changed=build.rs");

    // Kernel.toml 缺失时全部使用默认值
    let config: toml::Value = match fs::read_to_string("../Kernel.toml") {
        Ok(content) => toml::from_str(&content).expect("配置文件解析失败"),
        Err(_) => {
            println!("cargo:warning=Kernel.toml not found, using defaults");
            toml::Value::Table(toml::map::Map::new())
        }
    };

    generate_config_code(&config);
}

fn generate_config_code(config: &toml::Value) {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR 未设置"));

    let name = config.get("general")
        .and_then(|g| g.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("Rux-SPT");
    let version = config.get("general")
        .and_then(|g| g.get("version"))
        .and_then(|v| v.as_str())
        .unwrap_or("0.1.0");

    let page_size = int_of(config, "memory", "page_size", 4096);
    let page_sizes = page_sizes_of(config, page_size);
    let share_min = int_of(config, "memory", "share_min_page_size", 65536);
    assert!(page_sizes.contains(&share_min), "share_min_page_size 必须是支持的页大小");
    let default_szc = int_of(config, "memory", "default_share_szc", 1);
    assert!((default_szc as usize) < page_sizes.len(), "default_share_szc 超出范围");

    let sizes_list = page_sizes.iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    let config_code = format!(
        r#"//! Rux SPT 配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// 基本信息
// ============================================================

/// 名称
pub const KERNEL_NAME: &str = "{name}";

/// 版本
pub const KERNEL_VERSION: &str = "{version}";

// ============================================================
// 内存配置
// ============================================================

/// 页大小
pub const PAGE_SIZE: usize = {page_size};

/// 页大小位移
pub const PAGE_SHIFT: usize = {page_shift};

/// 支持的页大小等级（从小到大）
pub const PAGE_SIZES: [usize; {nsizes}] = [{sizes_list}];

/// 共享映射的最小页大小
pub const SHARE_MIN_PAGE_SIZE: usize = {share_min};

/// 默认共享页大小等级
pub const DEFAULT_SHARE_SZC: u8 = {default_szc};

// ============================================================
// SPT 配置
// ============================================================

/// 每页锁计数上限
pub const DISM_LOCK_MAX: u16 = {lock_max};

/// 粒度解锁等待页缓存清空的最长时间（秒）
pub const SPT_PCACHE_WAIT_SECS: u64 = {pcache_wait};

/// 丢弃附着时等待异步 I/O 完成的最长时间（时钟滴答）
pub const SPT_DETACH_WAIT_TICKS: u64 = {detach_wait};

/// minfree 除数
pub const MINFREE_DIVISOR: usize = {minfree_div};

// ============================================================
// 并行任务配置
// ============================================================

/// 小页作业最小分块
pub const VMTASK_SPGS_MINJOB: usize = {spgs};

/// 大页作业最小分块
pub const VMTASK_LPGS_MINJOB: usize = {lpgs};

/// 单个作业最大任务数
pub const VMTASK_MAX_TASKS: usize = {max_tasks};

// ============================================================
// 调度器配置
// ============================================================

/// 时钟频率（滴答/秒）
pub const SCHED_HZ: u64 = {hz};
"#,
        name = name,
        version = version,
        page_size = page_size,
        page_shift = page_size.trailing_zeros(),
        nsizes = page_sizes.len(),
        sizes_list = sizes_list,
        share_min = share_min,
        default_szc = default_szc,
        lock_max = int_of(config, "spt", "dism_lock_max", 0xfffe),
        pcache_wait = int_of(config, "spt", "pcache_wait_secs", 120),
        detach_wait = int_of(config, "spt", "detach_wait_ticks", 10),
        minfree_div = int_of(config, "spt", "minfree_divisor", 20),
        spgs = int_of(config, "vmtask", "spgs_minjob", 512),
        lpgs = int_of(config, "vmtask", "lpgs_minjob", 4),
        max_tasks = int_of(config, "vmtask", "max_tasks", 8),
        hz = int_of(config, "scheduler", "hz", 100),
    );

    let config_file = manifest_dir.join("src").join("config.rs");

    // 只有内容变化时才写入，避免每次编译都更新文件时间戳
    let existing_content = fs::read_to_string(&config_file).unwrap_or_default();
    if existing_content != config_code {
        fs::write(&config_file, &config_code)
            .expect("写入配置文件失败");
    }
}
