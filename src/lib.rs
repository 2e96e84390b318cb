//! UART Terminal 库
//!
//! 向调用方暴露一条逻辑全双工字节通道，由三种可互换的传输
//! 之一承载：伪终端（PTY）、多客户端 TCP 服务器或串口。
//! 调用方提供接收回调和同步的 write()，传输相关的 I/O、连接
//! 生命周期和线程边界全部由库管理。

pub mod terminal;
pub mod transport;
pub mod utils;

pub use terminal::{Terminal, TerminalOptions};
pub use transport::{Endpoint, Mode, RxCallback};
pub use utils::error::TerminalError;
pub use utils::state::LifecycleState;
