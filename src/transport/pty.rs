//! PTY 传输实现
//!
//! 分配一对伪终端描述符，从端路径发布给外部终端程序
//! （screen/picocom）接入，主端与回调之间双向转发字节。
//!
//! 从端在传输内部始终保持打开，因此外部程序反复打开/关闭从端
//! 不会终止传输；从端设为 raw 模式，字节原样透传，不做行规
//! 处理。仅支持 POSIX 平台。

use std::path::PathBuf;

use crate::utils::error::TerminalError;

use super::{Endpoint, RxCallback, Transport};

#[cfg(unix)]
use std::{
    fs::File,
    io::{Read, Write},
    os::fd::{AsFd, AsRawFd, OwnedFd, RawFd},
    sync::Arc,
    time::Duration,
};

#[cfg(unix)]
use nix::pty::openpty;
#[cfg(unix)]
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
#[cfg(unix)]
use nix::unistd::ttyname;
#[cfg(unix)]
use tokio::io::unix::AsyncFd;
#[cfg(unix)]
use tokio::task::JoinHandle;

#[cfg(unix)]
use super::READ_CHUNK_SIZE;

/// 从端关闭后重试读取前的等待时间
///
/// 某些平台在从端关闭后主端持续报告可读（EIO/EOF），
/// 小睡避免空转。
#[cfg(unix)]
const SECONDARY_CLOSED_BACKOFF: Duration = Duration::from_millis(100);

/// PTY 传输
pub struct PtyTransport {
    on_rx: RxCallback,
    running: bool,
    slave_path: Option<PathBuf>,
    #[cfg(unix)]
    master: Option<Arc<AsyncFd<File>>>,
    /// 从端描述符在传输存续期间保持打开，
    /// 使 PTY 对跨外部程序的多次打开存活
    #[cfg(unix)]
    _slave: Option<OwnedFd>,
    #[cfg(unix)]
    read_task: Option<JoinHandle<()>>,
}

impl PtyTransport {
    /// 创建新的 PTY 传输（不启动）
    pub fn new(on_rx: RxCallback) -> Self {
        Self {
            on_rx,
            running: false,
            slave_path: None,
            #[cfg(unix)]
            master: None,
            #[cfg(unix)]
            _slave: None,
            #[cfg(unix)]
            read_task: None,
        }
    }

    /// 主端读循环
    ///
    /// 每次就绪读取一个块并投递给回调。零长度读取或 EIO 表示
    /// 从端全部关闭，这不终止传输：PTY 对继续存活，等待外部
    /// 程序重新打开从端后恢复通信。
    #[cfg(unix)]
    async fn read_loop(master: Arc<AsyncFd<File>>, on_rx: RxCallback) {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let mut guard = match master.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    tracing::error!("PTY 等待可读失败: {}", e);
                    break;
                }
            };

            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(&mut buf)
            }) {
                Ok(Ok(0)) => {
                    tracing::debug!("PTY 从端已关闭，等待重新打开");
                    tokio::time::sleep(SECONDARY_CLOSED_BACKOFF).await;
                }
                Ok(Ok(n)) => {
                    on_rx.deliver(&buf[..n]);
                }
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
                    // Linux 上从端关闭表现为 EIO，同样可恢复
                    tracing::debug!("PTY 读返回 EIO（从端关闭），等待重新打开");
                    tokio::time::sleep(SECONDARY_CLOSED_BACKOFF).await;
                }
                Ok(Err(e)) => {
                    tracing::error!("PTY 读错误: {}", e);
                    break;
                }
                Err(_would_block) => {
                    // 就绪状态已清除，回到等待
                }
            }
        }
    }
}

/// 将描述符设为非阻塞（AsyncFd 要求）
#[cfg(unix)]
fn set_nonblocking(fd: RawFd) -> Result<(), TerminalError> {
    // SAFETY: fd 来自刚创建的 PTY 对，在调用期间保持有效
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(TerminalError::PtyOpenFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(TerminalError::PtyOpenFailed(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

#[cfg(unix)]
#[async_trait::async_trait]
impl Transport for PtyTransport {
    async fn start(&mut self) -> Result<(), TerminalError> {
        // 失败路径上 OwnedFd 自动关闭，不泄漏描述符
        let pty = openpty(None, None)
            .map_err(|e| TerminalError::PtyOpenFailed(e.to_string()))?;

        let slave_path = ttyname(pty.slave.as_fd())
            .map_err(|e| TerminalError::PtyOpenFailed(e.to_string()))?;

        // 从端设为 raw 模式：关闭回显和行规处理，字节原样透传
        let mut termios = tcgetattr(pty.slave.as_fd())
            .map_err(|e| TerminalError::PtyOpenFailed(e.to_string()))?;
        cfmakeraw(&mut termios);
        tcsetattr(pty.slave.as_fd(), SetArg::TCSANOW, &termios)
            .map_err(|e| TerminalError::PtyOpenFailed(e.to_string()))?;

        set_nonblocking(pty.master.as_raw_fd())?;

        let master_file = File::from(pty.master);
        let master = Arc::new(
            AsyncFd::new(master_file)
                .map_err(|e| TerminalError::PtyOpenFailed(e.to_string()))?,
        );

        self.read_task = Some(tokio::spawn(Self::read_loop(
            master.clone(),
            self.on_rx.clone(),
        )));

        self.master = Some(master);
        self._slave = Some(pty.slave);
        self.slave_path = Some(slave_path.clone());
        self.running = true;

        tracing::info!("PTY 终端就绪: {}", slave_path.display());
        tracing::info!("接入方式: screen {} 115200", slave_path.display());
        Ok(())
    }

    async fn stop(&mut self) {
        self.running = false;

        if let Some(task) = self.read_task.take() {
            task.abort();
            let _ = task.await;
        }

        // 关闭两端描述符，释放从端路径
        self.master = None;
        self._slave = None;
        self.slave_path = None;
        tracing::info!("PTY 终端已停止");
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        let master = match (&self.master, self.running) {
            (Some(master), true) => master.clone(),
            _ => return Ok(()),
        };

        // 部分写入循环直到全部写出或出错
        let mut written = 0;
        while written < data.len() {
            let mut guard = master.writable().await.map_err(TerminalError::Io)?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(&data[written..])
            }) {
                Ok(Ok(0)) => {
                    return Err(TerminalError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "PTY 写入返回 0",
                    )));
                }
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(TerminalError::Io(e)),
                Err(_would_block) => {}
            }
        }
        Ok(())
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.slave_path.clone().map(Endpoint::PtyPath)
    }
}

#[cfg(not(unix))]
#[async_trait::async_trait]
impl Transport for PtyTransport {
    async fn start(&mut self) -> Result<(), TerminalError> {
        Err(TerminalError::PtyUnsupported)
    }

    async fn stop(&mut self) {}

    async fn write(&mut self, _data: &[u8]) -> Result<(), TerminalError> {
        Ok(())
    }

    fn endpoint(&self) -> Option<Endpoint> {
        None
    }
}
