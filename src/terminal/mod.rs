//! 终端门面
//!
//! 向调用方暴露一条逻辑全双工字节通道，由构造时选定的传输
//! （PTY / TCP / Serial）承载。门面拥有一个专属后台线程，线程
//! 内运行单线程 tokio 运行时，所有传输 I/O 都在该上下文中执行：
//! 调用方线程永不因 I/O 阻塞。
//!
//! - `start()` 同步等待传输就绪或失败（有界超时）
//! - `write()` 线程安全，调度后立即返回；未运行时静默丢弃
//! - `stop()` 幂等，有界时间内返回
//! - 入站数据通过构造时注入的回调在后台线程上投递

pub mod options;

use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::transport::{
    Endpoint, Mode, PtyTransport, RxCallback, SerialTransport, TcpTransport, Transport,
};
use crate::utils::error::TerminalError;
use crate::utils::state::{LifecycleState, LifecycleStateMachine};

pub use options::TerminalOptions;

/// 等待后台上下文报告传输启动结果的上限
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// 等待后台上下文退出的上限（超时后分离，不无限等待）
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// 发往后台上下文的命令
enum Command {
    /// 出站写入（按发送顺序投递到线路）
    Write(Vec<u8>),
    /// 有序关闭
    Shutdown,
}

/// 运行中的后台上下文句柄
struct RunnerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// 传输端点信息（启动成功后由后台上下文回报）
    endpoint: Option<Endpoint>,
    thread: Option<thread::JoinHandle<()>>,
    /// 后台线程退出信号（stop 时有界等待）
    done_rx: Mutex<std_mpsc::Receiver<()>>,
}

/// UART 终端
///
/// 每个实例同一时刻至多持有一个存活的后台上下文和一个传输；
/// 停止后重新 `start()` 会完整重建两者，不复用旧上下文。
pub struct Terminal {
    options: TerminalOptions,
    on_rx: RxCallback,
    state: LifecycleStateMachine,
    runner: Option<RunnerHandle>,
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("options", &self.options)
            .field("state", &self.state)
            .field("runner", &self.runner.is_some())
            .finish()
    }
}

/// 按模式构造传输实例
fn build_transport(options: &TerminalOptions, on_rx: RxCallback) -> Box<dyn Transport> {
    match options.mode {
        Mode::Pty => Box::new(PtyTransport::new(on_rx)),
        Mode::Tcp => Box::new(TcpTransport::new(
            on_rx,
            options.tcp_host.clone(),
            options.tcp_port,
        )),
        Mode::Serial => {
            // 构造时已校验 serial_port 存在
            let port = options.serial_port.clone().unwrap_or_default();
            Box::new(SerialTransport::new(on_rx, port, options.serial_baud))
        }
    }
}

/// 后台线程主体
///
/// 构建单线程运行时，启动传输并回报结果，随后进入命令循环
/// 直到收到 Shutdown 或命令通道关闭，最后停止传输。
fn run_background(
    options: TerminalOptions,
    on_rx: RxCallback,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ready_tx: std_mpsc::Sender<Result<Option<Endpoint>, TerminalError>>,
    done_tx: std_mpsc::Sender<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("后台运行时创建失败: {}", e);
            let _ = ready_tx.send(Err(TerminalError::Io(e)));
            let _ = done_tx.send(());
            return;
        }
    };

    runtime.block_on(async move {
        let mut transport = build_transport(&options, on_rx);

        match transport.start().await {
            Ok(()) => {
                let _ = ready_tx.send(Ok(transport.endpoint()));
            }
            Err(e) => {
                // 获取失败同步回报给 start() 的调用方
                let _ = ready_tx.send(Err(e));
                return;
            }
        }

        // 命令循环：写入按调用顺序投递；Shutdown 之后排队的
        // 写入被丢弃（关闭时不提供持久性保证）
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Write(data) => {
                    if let Err(e) = transport.write(&data).await {
                        tracing::warn!("出站写入失败: {}", e);
                    }
                }
                Command::Shutdown => break,
            }
        }

        transport.stop().await;
    });

    let _ = done_tx.send(());
}

impl Terminal {
    /// 创建终端
    ///
    /// 仅校验配置，不获取任何资源；serial 模式缺少设备路径或
    /// 模式未知在此处报错。
    pub fn new(
        options: TerminalOptions,
        on_rx: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<Self, TerminalError> {
        options.validate()?;
        Ok(Self {
            options,
            on_rx: RxCallback::new(on_rx),
            state: LifecycleStateMachine::new(),
            runner: None,
        })
    }

    /// 启动终端
    ///
    /// 创建后台上下文并在其中启动传输；同步等待传输就绪。
    /// 已在 Starting/Running 状态时报 AlreadyStarted；
    /// 平台不支持、能力缺失或 bind/open 失败时返回相应错误，
    /// 此时终端回到 Idle，可再次尝试 start。
    pub fn start(&mut self) -> Result<(), TerminalError> {
        if !self.state.is_idle() {
            return Err(TerminalError::AlreadyStarted);
        }
        self.state.transition_to(LifecycleState::Starting);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (done_tx, done_rx) = std_mpsc::channel();

        let options = self.options.clone();
        let on_rx = self.on_rx.clone();
        let spawned = thread::Builder::new()
            .name("uart-terminal".to_string())
            .spawn(move || run_background(options, on_rx, cmd_rx, ready_tx, done_tx));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.state.transition_to(LifecycleState::Idle);
                return Err(TerminalError::Io(e));
            }
        };

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(endpoint)) => {
                self.runner = Some(RunnerHandle {
                    cmd_tx,
                    endpoint,
                    thread: Some(handle),
                    done_rx: Mutex::new(done_rx),
                });
                self.state.transition_to(LifecycleState::Running);
                tracing::info!("终端已启动 ({} 模式)", self.options.mode);
                Ok(())
            }
            Ok(Err(e)) => {
                // 传输启动失败：后台线程自行结束
                let _ = handle.join();
                self.state.transition_to(LifecycleState::Idle);
                Err(e)
            }
            Err(_) => {
                tracing::error!("后台上下文未在 {:?} 内就绪", START_TIMEOUT);
                self.state.transition_to(LifecycleState::Idle);
                Err(TerminalError::StartupTimeout)
            }
        }
    }

    /// 停止终端
    ///
    /// 幂等：未启动时为空操作。通知后台上下文有序关闭传输，
    /// 随后有界等待线程退出；超时则分离线程并照常返回，终端
    /// 回到 Idle，允许全新的 start()。
    pub fn stop(&mut self) {
        let runner = match self.runner.take() {
            Some(runner) => runner,
            None => {
                tracing::debug!("终端未运行，stop 为空操作");
                return;
            }
        };

        self.state.transition_to(LifecycleState::Stopping);
        let _ = runner.cmd_tx.send(Command::Shutdown);

        let done_rx = match runner.done_rx.into_inner() {
            Ok(rx) => rx,
            Err(poisoned) => poisoned.into_inner(),
        };

        match done_rx.recv_timeout(STOP_TIMEOUT) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(handle) = runner.thread {
                    let _ = handle.join();
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                // 线程句柄被丢弃（分离）；资源视为已回收
                tracing::warn!("后台上下文未在 {:?} 内退出，分离处理", STOP_TIMEOUT);
            }
        }

        self.state.transition_to(LifecycleState::Idle);
        tracing::info!("终端已停止");
    }

    /// 写出站数据（线程安全，不阻塞）
    ///
    /// 数据交接给后台上下文后立即返回；传输层失败被就地记录，
    /// 不会传播到这里。未处于 Running 状态时静默丢弃。
    pub fn write(&self, data: &[u8]) {
        if !self.state.is_running() {
            tracing::trace!("终端未运行，丢弃 {} bytes", data.len());
            return;
        }
        if let Some(runner) = &self.runner {
            if runner.cmd_tx.send(Command::Write(data.to_vec())).is_err() {
                tracing::warn!("后台上下文已退出，丢弃写入");
            }
        }
    }

    /// 当前传输模式
    pub fn mode(&self) -> Mode {
        self.options.mode
    }

    /// 当前生命周期状态
    pub fn state(&self) -> LifecycleState {
        self.state.state()
    }

    /// TCP 实际监听端口
    ///
    /// 仅 tcp 模式且启动成功后有值（port = 0 时为系统分配的端口）。
    pub fn tcp_port(&self) -> Option<u16> {
        match self.runner.as_ref()?.endpoint {
            Some(Endpoint::TcpPort(port)) => Some(port),
            _ => None,
        }
    }

    /// PTY 从端路径
    ///
    /// 仅 pty 模式且启动成功后有值，外部终端程序由此接入。
    pub fn pty_path(&self) -> Option<&Path> {
        match self.runner.as_ref()?.endpoint {
            Some(Endpoint::PtyPath(ref path)) => Some(path.as_path()),
            _ => None,
        }
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        // 尽力通知后台关闭，不在 drop 中阻塞等待
        if let Some(runner) = self.runner.take() {
            let _ = runner.cmd_tx.send(Command::Shutdown);
        }
    }
}
