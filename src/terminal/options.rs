//! 终端配置选项
//!
//! 定义构造终端所需的配置数据结构。

use serde::{Deserialize, Serialize};

use crate::transport::Mode;
use crate::utils::error::TerminalError;

/// TCP 默认监听地址
pub const DEFAULT_TCP_HOST: &str = "127.0.0.1";

/// TCP 默认监听端口（0 表示由系统分配）
pub const DEFAULT_TCP_PORT: u16 = 5555;

/// 串口默认波特率
pub const DEFAULT_SERIAL_BAUD: u32 = 115200;

fn default_tcp_host() -> String {
    DEFAULT_TCP_HOST.to_string()
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_serial_baud() -> u32 {
    DEFAULT_SERIAL_BAUD
}

/// 终端配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminalOptions {
    /// 传输模式
    pub mode: Mode,
    /// TCP 监听地址（仅 tcp 模式）
    #[serde(default = "default_tcp_host")]
    pub tcp_host: String,
    /// TCP 监听端口（仅 tcp 模式，0 表示系统分配）
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// 串口设备路径（serial 模式必填，loop:// 为虚拟回环）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,
    /// 串口波特率（仅 serial 模式）
    #[serde(default = "default_serial_baud")]
    pub serial_baud: u32,
}

impl TerminalOptions {
    /// 创建指定模式的默认配置
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            tcp_host: default_tcp_host(),
            tcp_port: default_tcp_port(),
            serial_port: None,
            serial_baud: default_serial_baud(),
        }
    }

    /// 设置 TCP 监听地址
    pub fn with_tcp_host(mut self, host: impl Into<String>) -> Self {
        self.tcp_host = host.into();
        self
    }

    /// 设置 TCP 监听端口
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    /// 设置串口设备路径
    pub fn with_serial_port(mut self, port: impl Into<String>) -> Self {
        self.serial_port = Some(port.into());
        self
    }

    /// 设置串口波特率
    pub fn with_serial_baud(mut self, baud: u32) -> Self {
        self.serial_baud = baud;
        self
    }

    /// 校验配置
    ///
    /// 在触碰任何资源之前执行，serial 模式缺少设备路径时报错。
    pub fn validate(&self) -> Result<(), TerminalError> {
        if self.mode == Mode::Serial && self.serial_port.is_none() {
            return Err(TerminalError::InvalidConfig(
                "serial 模式需要 serial_port".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = TerminalOptions::new(Mode::Tcp);
        assert_eq!(options.tcp_host, "127.0.0.1");
        assert_eq!(options.tcp_port, 5555);
        assert_eq!(options.serial_baud, 115200);
        assert!(options.serial_port.is_none());
    }

    #[test]
    fn test_builders() {
        let options = TerminalOptions::new(Mode::Serial)
            .with_tcp_host("0.0.0.0")
            .with_tcp_port(0)
            .with_serial_port("loop://")
            .with_serial_baud(9600);

        assert_eq!(options.tcp_host, "0.0.0.0");
        assert_eq!(options.tcp_port, 0);
        assert_eq!(options.serial_port.as_deref(), Some("loop://"));
        assert_eq!(options.serial_baud, 9600);
    }

    #[test]
    fn test_validate_serial_requires_port() {
        let options = TerminalOptions::new(Mode::Serial);
        let err = options.validate().unwrap_err();
        assert!(err.is_config_error());

        let options = options.with_serial_port("/dev/ttyUSB0");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_other_modes() {
        assert!(TerminalOptions::new(Mode::Pty).validate().is_ok());
        assert!(TerminalOptions::new(Mode::Tcp).validate().is_ok());
    }

    #[test]
    fn test_serde_roundtrip() {
        let options = TerminalOptions::new(Mode::Serial).with_serial_port("loop://");
        let json = serde_json::to_string(&options).unwrap();
        let parsed: TerminalOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn test_serde_defaults_filled_in() {
        let parsed: TerminalOptions = serde_json::from_str(r#"{"mode":"tcp"}"#).unwrap();
        assert_eq!(parsed.mode, Mode::Tcp);
        assert_eq!(parsed.tcp_host, "127.0.0.1");
        assert_eq!(parsed.tcp_port, 5555);
        assert_eq!(parsed.serial_baud, 115200);
    }
}
