//! 错误类型定义
//!
//! 定义 UART 终端的错误类型，提供描述性错误消息。
//!
//! ## 功能
//! - 定义 TerminalError 枚举，涵盖所有可能的错误类型
//! - 实现错误转换（From trait）
//! - 提供错误分类和辅助方法
//!
//! 传输层内部的瞬态 I/O 错误不会出现在这里：它们在后台上下文中
//! 被记录并就地恢复，不会传播到调用方。

use thiserror::Error;

/// UART 终端错误类型
#[derive(Debug, Error)]
pub enum TerminalError {
    /// 配置无效（构造时检查，尚未获取任何资源）
    #[error("配置无效: {0}")]
    InvalidConfig(String),

    /// 终端已经启动
    #[error("终端已经启动")]
    AlreadyStarted,

    /// 当前平台不支持 PTY
    #[error("当前平台不支持 PTY")]
    PtyUnsupported,

    /// 串口能力不可用（编译时未启用 serial 特性）
    #[error("串口能力不可用: {0}")]
    SerialUnavailable(String),

    /// PTY 创建失败
    #[error("PTY 创建失败: {0}")]
    PtyOpenFailed(String),

    /// TCP 监听失败
    #[error("TCP 监听失败 {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    /// 串口打开失败
    #[error("串口打开失败 {port}: {reason}")]
    SerialOpenFailed { port: String, reason: String },

    /// 后台上下文启动超时
    #[error("后台上下文启动超时")]
    StartupTimeout,

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl TerminalError {
    /// 获取错误类型名称
    pub fn error_type(&self) -> &'static str {
        match self {
            TerminalError::InvalidConfig(_) => "invalid_config",
            TerminalError::AlreadyStarted => "already_started",
            TerminalError::PtyUnsupported => "pty_unsupported",
            TerminalError::SerialUnavailable(_) => "serial_unavailable",
            TerminalError::PtyOpenFailed(_) => "pty_open_failed",
            TerminalError::BindFailed { .. } => "bind_failed",
            TerminalError::SerialOpenFailed { .. } => "serial_open_failed",
            TerminalError::StartupTimeout => "startup_timeout",
            TerminalError::Io(_) => "io_error",
        }
    }

    /// 检查是否为构造阶段错误（尚未触及任何资源）
    pub fn is_config_error(&self) -> bool {
        matches!(self, TerminalError::InvalidConfig(_))
    }

    /// 检查是否为能力缺失错误（平台/运行环境不支持所选传输）
    pub fn is_capability_error(&self) -> bool {
        matches!(
            self,
            TerminalError::PtyUnsupported | TerminalError::SerialUnavailable(_)
        )
    }

    /// 检查是否为资源获取错误（bind/open 失败，已释放部分资源）
    pub fn is_acquisition_error(&self) -> bool {
        matches!(
            self,
            TerminalError::PtyOpenFailed(_)
                | TerminalError::BindFailed { .. }
                | TerminalError::SerialOpenFailed { .. }
        )
    }

    /// 检查是否为生命周期误用错误
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(self, TerminalError::AlreadyStarted)
    }

    // ============ 错误构造辅助方法 ============

    /// 创建 TCP 监听失败错误（包含地址信息）
    pub fn bind_failed(host: &str, port: u16, reason: impl ToString) -> Self {
        TerminalError::BindFailed {
            addr: format!("{}:{}", host, port),
            reason: reason.to_string(),
        }
    }

    /// 创建串口打开失败错误（包含设备信息）
    pub fn serial_open_failed(port: &str, reason: impl ToString) -> Self {
        TerminalError::SerialOpenFailed {
            port: port.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TerminalError::InvalidConfig("serial 模式需要 serial_port".to_string());
        assert_eq!(err.to_string(), "配置无效: serial 模式需要 serial_port");

        let err = TerminalError::AlreadyStarted;
        assert_eq!(err.to_string(), "终端已经启动");
    }

    #[test]
    fn test_error_types() {
        assert_eq!(
            TerminalError::InvalidConfig("".to_string()).error_type(),
            "invalid_config"
        );
        assert_eq!(TerminalError::AlreadyStarted.error_type(), "already_started");
        assert_eq!(TerminalError::PtyUnsupported.error_type(), "pty_unsupported");
        assert_eq!(
            TerminalError::bind_failed("127.0.0.1", 5555, "in use").error_type(),
            "bind_failed"
        );
    }

    #[test]
    fn test_is_capability_error() {
        assert!(TerminalError::PtyUnsupported.is_capability_error());
        assert!(TerminalError::SerialUnavailable("".to_string()).is_capability_error());
        assert!(!TerminalError::AlreadyStarted.is_capability_error());
    }

    #[test]
    fn test_is_acquisition_error() {
        assert!(TerminalError::bind_failed("127.0.0.1", 80, "denied").is_acquisition_error());
        assert!(TerminalError::serial_open_failed("/dev/ttyUSB0", "busy").is_acquisition_error());
        assert!(TerminalError::PtyOpenFailed("".to_string()).is_acquisition_error());
        assert!(!TerminalError::InvalidConfig("".to_string()).is_acquisition_error());
    }

    #[test]
    fn test_is_lifecycle_error() {
        assert!(TerminalError::AlreadyStarted.is_lifecycle_error());
        assert!(!TerminalError::PtyUnsupported.is_lifecycle_error());
    }

    #[test]
    fn test_bind_failed_helper() {
        let err = TerminalError::bind_failed("0.0.0.0", 5555, "权限不足");
        let msg = err.to_string();
        assert!(msg.contains("0.0.0.0:5555"));
        assert!(msg.contains("权限不足"));
    }

    #[test]
    fn test_serial_open_failed_helper() {
        let err = TerminalError::serial_open_failed("/dev/ttyUSB0", "设备不存在");
        let msg = err.to_string();
        assert!(msg.contains("/dev/ttyUSB0"));
        assert!(msg.contains("设备不存在"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: TerminalError = io_err.into();
        assert_eq!(err.error_type(), "io_error");
    }
}
