//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 错误代码定义
//!
//! - `SptError`：共享段管理内部使用的错误分类
//! - `Errno`：返回给系统调用层的标准错误码（和 include/uapi/asm-generic/errno.h 一致）

/// 共享段错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SptError {
    /// 大小、对齐、标志或部分范围解除映射等参数错误
    ConfigError,
    /// 内存或配额不足
    ResourceExhausted,
    /// 平台或段类型不支持该操作
    Unsupported,
    /// 仍有软锁或异步 I/O，清空页缓存后可重试
    Busy,
    /// 范围超出段的实际大小
    NotMapped,
    /// 访问权限不符
    AccessDenied,
    /// 内部不变量被破坏
    Internal(&'static str),
}

impl SptError {
    /// 构造内部错误并记录诊断信息
    pub fn internal(what: &'static str) -> Self {
        log::error!("spt: invariant violated: {}", what);
        SptError::Internal(what)
    }
}

impl core::fmt::Display for SptError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SptError::ConfigError => write!(f, "invalid configuration"),
            SptError::ResourceExhausted => write!(f, "resource exhausted"),
            SptError::Unsupported => write!(f, "operation not supported"),
            SptError::Busy => write!(f, "segment busy"),
            SptError::NotMapped => write!(f, "range not mapped"),
            SptError::AccessDenied => write!(f, "access denied"),
            SptError::Internal(what) => write!(f, "internal error: {}", what),
        }
    }
}

/// 标准错误代码
///
/// 使用方法：
/// ```rust
/// use spt::errno::{Errno, SptError};
///
/// let errno: Errno = SptError::Busy.into();
/// assert_eq!(errno.as_neg_i32(), -16);
/// ```
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Errno {
    /// I/O error (EIO, 5)
    IOError = 5,

    /// Try again (EAGAIN, 11)
    TryAgain = 11,

    /// Permission denied (EACCES, 13)
    PermissionDenied = 13,

    /// Bad address (EFAULT, 14)
    BadAddress = 14,

    /// Device or resource busy (EBUSY, 16)
    DeviceOrResourceBusy = 16,

    /// Invalid argument (EINVAL, 22)
    InvalidArgument = 22,

    /// Operation not supported (EOPNOTSUPP, 95)
    NotSupported = 95,
}

impl Errno {
    /// 获取错误代码的正数值（用于比较）
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// 获取错误代码的负数值（用于系统调用返回）
    #[inline]
    pub const fn as_neg_i32(self) -> i32 {
        -(self as i32)
    }
}

impl From<SptError> for Errno {
    fn from(err: SptError) -> Self {
        match err {
            SptError::ConfigError => Errno::InvalidArgument,
            SptError::ResourceExhausted => Errno::TryAgain,
            SptError::Unsupported => Errno::NotSupported,
            SptError::Busy => Errno::DeviceOrResourceBusy,
            SptError::NotMapped => Errno::BadAddress,
            SptError::AccessDenied => Errno::PermissionDenied,
            SptError::Internal(_) => Errno::IOError,
        }
    }
}

/// 常用的错误代码常量
pub mod constants {
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const EOPNOTSUPP: i32 = 95;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_values() {
        assert_eq!(Errno::InvalidArgument.as_i32(), constants::EINVAL);
        assert_eq!(Errno::BadAddress.as_i32(), constants::EFAULT);
        assert_eq!(Errno::NotSupported.as_i32(), constants::EOPNOTSUPP);
        assert_eq!(Errno::TryAgain.as_neg_i32(), -constants::EAGAIN);
    }

    #[test]
    fn test_spt_error_mapping() {
        assert_eq!(Errno::from(SptError::ConfigError), Errno::InvalidArgument);
        assert_eq!(Errno::from(SptError::ResourceExhausted), Errno::TryAgain);
        assert_eq!(Errno::from(SptError::Unsupported), Errno::NotSupported);
        assert_eq!(Errno::from(SptError::Busy), Errno::DeviceOrResourceBusy);
        assert_eq!(Errno::from(SptError::NotMapped), Errno::BadAddress);
        assert_eq!(Errno::from(SptError::AccessDenied), Errno::PermissionDenied);
        assert_eq!(Errno::from(SptError::Internal("x")), Errno::IOError);
    }
}
