//! 传输层模块
//!
//! 定义统一的 Transport 能力接口和三种实现：
//! - PTY：伪终端对，供 screen/picocom 等外部程序接入
//! - TCP：多客户端 TCP 服务器，供 telnet/nc 接入
//! - Serial：真实或虚拟（loop://）串口
//!
//! 所有传输的异步操作都运行在 Terminal 拥有的单线程后台上下文中，
//! 可变状态只在该线程上被触碰。

pub mod pty;
pub mod serial;
pub mod tcp;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::utils::error::TerminalError;

pub use pty::PtyTransport;
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// 单次读取的块大小（字节）
///
/// 块边界不构成消息边界，调用方不得依赖。
pub const READ_CHUNK_SIZE: usize = 1024;

/// 传输模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// 伪终端
    Pty,
    /// TCP 服务器
    Tcp,
    /// 串口
    Serial,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Pty => write!(f, "pty"),
            Mode::Tcp => write!(f, "tcp"),
            Mode::Serial => write!(f, "serial"),
        }
    }
}

impl FromStr for Mode {
    type Err = TerminalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pty" => Ok(Mode::Pty),
            "tcp" => Ok(Mode::Tcp),
            "serial" => Ok(Mode::Serial),
            other => Err(TerminalError::InvalidConfig(format!(
                "未知模式: {}",
                other
            ))),
        }
    }
}

/// 传输端点信息（启动成功后可查询）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP 实际监听端口（port = 0 时由系统分配）
    TcpPort(u16),
    /// PTY 从端路径（外部终端程序接入点）
    PtyPath(PathBuf),
}

/// 接收回调
///
/// 包装调用方提供的回调函数。每次投递隔离回调内部的 panic：
/// panic 被记录，读取继续，传输不受影响。
///
/// 回调在后台上下文线程上被顺序调用，一次投递完成后才开始下一次。
#[derive(Clone)]
pub struct RxCallback {
    inner: Arc<dyn Fn(&[u8]) + Send + Sync>,
}

impl RxCallback {
    /// 创建新的接收回调
    pub fn new(f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    /// 投递一段入站数据
    ///
    /// 回调 panic 被就地捕获并记录，不会中断传输。
    pub fn deliver(&self, data: &[u8]) {
        let result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (self.inner)(data)));
        if result.is_err() {
            tracing::error!("接收回调 panic，已忽略 ({} bytes)", data.len());
        }
    }
}

impl fmt::Debug for RxCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxCallback").finish_non_exhaustive()
    }
}

/// 传输能力接口
///
/// 三种传输实现的统一契约。`start`/`stop`/`write` 都在后台上下文中
/// 执行；入站数据由各实现通过 RxCallback 投递。
#[async_trait]
pub trait Transport: Send {
    /// 启动传输，获取传输特定资源
    ///
    /// 每个生命周期只允许调用一次。失败时必须先释放已获取的
    /// 部分资源再返回错误。
    async fn start(&mut self) -> Result<(), TerminalError>;

    /// 停止传输，释放所有资源并取消未完成的读取
    ///
    /// 尽力而为：即使传输已经因错误降级也必须成功返回；
    /// start 从未成功时调用也必须安全。
    async fn stop(&mut self);

    /// 写出站数据
    ///
    /// 失败由调用此方法的后台任务记录，不会传播到 Terminal::write
    /// 的调用方。
    async fn write(&mut self, data: &[u8]) -> Result<(), TerminalError>;

    /// 查询端点信息（仅启动成功后有值）
    fn endpoint(&self) -> Option<Endpoint>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_mode_from_str() {
        assert_eq!("pty".parse::<Mode>().unwrap(), Mode::Pty);
        assert_eq!("tcp".parse::<Mode>().unwrap(), Mode::Tcp);
        assert_eq!("serial".parse::<Mode>().unwrap(), Mode::Serial);

        let err = "bogus".parse::<Mode>().unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_mode_display_roundtrip() {
        for mode in [Mode::Pty, Mode::Tcp, Mode::Serial] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_mode_serde() {
        assert_eq!(serde_json::to_string(&Mode::Pty).unwrap(), "\"pty\"");
        assert_eq!(
            serde_json::from_str::<Mode>("\"serial\"").unwrap(),
            Mode::Serial
        );
    }

    #[test]
    fn test_callback_delivers() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let cb = RxCallback::new(move |data| {
            count_clone.fetch_add(data.len(), Ordering::SeqCst);
        });

        cb.deliver(b"hello");
        cb.deliver(b"!");
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_callback_panic_contained() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let cb = RxCallback::new(move |data| {
            if data == b"boom" {
                panic!("callback exploded");
            }
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        cb.deliver(b"ok");
        cb.deliver(b"boom"); // panic 被捕获，投递继续
        cb.deliver(b"ok");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
