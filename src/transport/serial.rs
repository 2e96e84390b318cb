//! 串口传输实现
//!
//! 打开命名串口设备（或 loop:// 虚拟回环），以固定短间隔轮询
//! "可读字节数"，有数据时一次读出并转发给回调。
//!
//! 轮询是为延迟做出的忙等权衡（串口在本设计中没有原生就绪
//! 通知），属于已知限制而非缺陷。
//!
//! 真实设备依赖 serialport crate，位于可选的 serial 特性之后；
//! 特性未启用时 start() 在触碰任何设备之前返回能力错误。
//! loop:// 回环设备内置于 crate，不依赖该特性。

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::utils::error::TerminalError;

use super::{Endpoint, RxCallback, Transport};

/// 轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 虚拟回环设备名（写入的字节在同一句柄上变为可读）
pub const LOOPBACK_DEVICE: &str = "loop://";

/// 串口设备抽象
///
/// 传输通过该接口访问设备：真实串口或内存回环设备。
pub trait SerialDevice: Send {
    /// 查询当前可读字节数
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// 读取最多 buf.len() 字节，返回实际读取数
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// 写出全部字节
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// 刷新输出缓冲，强制发送
    fn flush(&mut self) -> io::Result<()>;
}

/// 内存回环设备
///
/// 写入的字节进入内部队列，随后可从同一句柄读出。
/// 用于在没有硬件的环境中测试串口传输逻辑。
pub struct LoopbackDevice {
    buffer: VecDeque<u8>,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
        }
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialDevice for LoopbackDevice {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(self.buffer.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.buffer.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.buffer.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.buffer.extend(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 真实串口设备（serialport crate 适配）
#[cfg(feature = "serial")]
struct NativeSerialDevice {
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serial")]
impl SerialDevice for NativeSerialDevice {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.port, buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.port, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.port)
    }
}

/// 打开真实串口设备
#[cfg(feature = "serial")]
fn open_device(port: &str, baud: u32) -> Result<Box<dyn SerialDevice>, TerminalError> {
    let native = serialport::new(port, baud)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| TerminalError::serial_open_failed(port, e))?;
    Ok(Box::new(NativeSerialDevice { port: native }))
}

/// 串口能力缺失时的占位实现（能力检查先于任何设备访问）
#[cfg(not(feature = "serial"))]
fn open_device(_port: &str, _baud: u32) -> Result<Box<dyn SerialDevice>, TerminalError> {
    Err(TerminalError::SerialUnavailable(
        "编译时未启用 serial 特性".to_string(),
    ))
}

/// 判断错误是否表示设备已不存在
fn is_device_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected
    )
}

type SharedDevice = Arc<Mutex<Box<dyn SerialDevice>>>;

/// 串口传输
pub struct SerialTransport {
    port_name: String,
    baud: u32,
    on_rx: RxCallback,
    /// 与轮询任务共享：设备消失时传输自行停止
    running: Arc<AtomicBool>,
    device: Option<SharedDevice>,
    poll_task: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// 创建新的串口传输（不启动）
    pub fn new(on_rx: RxCallback, port_name: impl Into<String>, baud: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud,
            on_rx,
            running: Arc::new(AtomicBool::new(false)),
            device: None,
            poll_task: None,
        }
    }

    /// 使用预置设备创建传输（测试注入）
    #[cfg(test)]
    fn with_device(on_rx: RxCallback, device: Box<dyn SerialDevice>) -> Self {
        let mut transport = Self::new(on_rx, "test://", 115200);
        transport.device = Some(Arc::new(Mutex::new(device)));
        transport
    }

    /// 单次轮询：有数据则读出全部可读字节
    fn poll_once(device: &mut Box<dyn SerialDevice>) -> io::Result<Option<Vec<u8>>> {
        let available = device.bytes_to_read()?;
        if available == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; available];
        let n = device.read(&mut buf)?;
        buf.truncate(n);
        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buf))
        }
    }

    /// 轮询循环
    ///
    /// 每个周期查询可读字节数并读出转发；读错误记录后继续，
    /// 设备消失时停止传输。
    async fn poll_loop(device: SharedDevice, on_rx: RxCallback, running: Arc<AtomicBool>) {
        while running.load(Ordering::SeqCst) {
            let polled = {
                let mut dev = device.lock().await;
                Self::poll_once(&mut dev)
            };

            match polled {
                Ok(Some(data)) => on_rx.deliver(&data),
                Ok(None) => {}
                Err(e) if is_device_gone(&e) => {
                    tracing::error!("串口设备已移除，传输停止: {}", e);
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    tracing::warn!("串口读错误: {}", e);
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait::async_trait]
impl Transport for SerialTransport {
    async fn start(&mut self) -> Result<(), TerminalError> {
        if self.device.is_none() {
            let device: Box<dyn SerialDevice> = if self.port_name == LOOPBACK_DEVICE {
                Box::new(LoopbackDevice::new())
            } else {
                open_device(&self.port_name, self.baud)?
            };
            self.device = Some(Arc::new(Mutex::new(device)));
        }

        let device = self.device.as_ref().map(Arc::clone);
        self.running.store(true, Ordering::SeqCst);
        if let Some(device) = device {
            self.poll_task = Some(tokio::spawn(Self::poll_loop(
                device,
                self.on_rx.clone(),
                self.running.clone(),
            )));
        }

        tracing::info!("串口终端就绪: {} @ {} baud", self.port_name, self.baud);
        Ok(())
    }

    async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        // 轮询任务可能正处于 sleep 中，abort 直接取消
        if let Some(task) = self.poll_task.take() {
            task.abort();
            let _ = task.await;
        }

        self.device = None;
        tracing::info!("串口终端已停止");
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let device = match &self.device {
            Some(device) => device.clone(),
            None => return Ok(()),
        };

        let mut dev = device.lock().await;
        let result = dev.write_all(data).and_then(|_| dev.flush());
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_device_gone(&e) => {
                tracing::error!("串口设备已移除，传输停止: {}", e);
                self.running.store(false, Ordering::SeqCst);
                Err(TerminalError::Io(e))
            }
            Err(e) => Err(TerminalError::Io(e)),
        }
    }

    fn endpoint(&self) -> Option<Endpoint> {
        None
    }
}


/// 回环串口的载荷完整性属性测试
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// 对于任意非空字节序列，经 loop:// 写入后回调收到的
        /// 字节与写入完全一致，无丢失无改动
        #[test]
        fn prop_loopback_payload_intact(payload in prop::collection::vec(any::<u8>(), 1..512)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let cb = RxCallback::new(move |data: &[u8]| {
                    let _ = tx.send(data.to_vec());
                });

                let mut transport = SerialTransport::new(cb, LOOPBACK_DEVICE, 115200);
                transport.start().await.unwrap();
                transport.write(&payload).await.unwrap();

                let mut collected = Vec::new();
                while collected.len() < payload.len() {
                    let chunk = tokio::time::timeout(
                        std::time::Duration::from_secs(2),
                        rx.recv(),
                    )
                    .await
                    .expect("callback timed out")
                    .unwrap();
                    collected.extend_from_slice(&chunk);
                }
                prop_assert_eq!(collected, payload.clone());

                transport.stop().await;
                Ok(())
            })?;
        }
    }
}
