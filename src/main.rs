//! UART Terminal CLI 入口点
//!
//! 演示程序：构造终端后回显收到的数据，周期性发送演示消息，
//! 并打印收发统计。
//! 主要功能：
//! - 三种传输模式（pty / tcp / serial）的命令行选择
//! - 接收回显与周期性演示发送
//! - RX/TX 字节统计

use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use uart_terminal::{Mode, Terminal, TerminalOptions};

/// UART 终端演示
#[derive(Parser, Debug)]
#[command(name = "uart-term", version, about = "UART 终端演示程序")]
struct Args {
    /// 终端模式 (pty / tcp / serial)
    #[arg(long, default_value = "pty")]
    mode: Mode,

    /// TCP 监听地址（仅 tcp 模式）
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// TCP 监听端口（仅 tcp 模式，0 表示系统分配）
    #[arg(long, default_value_t = 5555)]
    port: u16,

    /// 串口设备路径（serial 模式必填，loop:// 为虚拟回环）
    #[arg(long)]
    serial_port: Option<String>,

    /// 串口波特率（仅 serial 模式）
    #[arg(long, default_value_t = 115200)]
    baud: u32,
}

fn main() -> anyhow::Result<()> {
    // 初始化日志系统，输出到 stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let mut options = TerminalOptions::new(args.mode)
        .with_tcp_host(args.host)
        .with_tcp_port(args.port)
        .with_serial_baud(args.baud);
    if let Some(port) = args.serial_port {
        options = options.with_serial_port(port);
    }

    // 收到的数据送入通道，由主循环回显
    let (rx_tx, rx_rx) = std::sync::mpsc::channel::<Vec<u8>>();
    let mut terminal = Terminal::new(options, move |data| {
        let _ = rx_tx.send(data.to_vec());
    })?;

    terminal.start()?;

    println!("UART Terminal Demo");
    println!("==================");
    if let Some(port) = terminal.tcp_port() {
        println!("接入方式: telnet 127.0.0.1 {}", port);
    }
    if let Some(path) = terminal.pty_path() {
        println!("接入方式: screen {} 115200", path.display());
    }
    println!("终端会周期性发送演示消息，输入内容将被回显。");
    println!("Ctrl+C 退出。");
    println!();

    let started = Instant::now();
    let mut rx_bytes_total: u64 = 0;
    let mut tx_bytes_total: u64 = 0;
    let mut tx_counter: u64 = 0;
    let mut last_demo = Instant::now();
    let mut last_stats = Instant::now();

    loop {
        // 取出收到的数据：打印并回显
        while let Ok(data) = rx_rx.try_recv() {
            rx_bytes_total += data.len() as u64;
            let text = String::from_utf8_lossy(&data).into_owned();
            println!("RX: {:?}", text);

            let echo = format!("Echo: {}", text);
            terminal.write(echo.as_bytes());
            tx_bytes_total += echo.len() as u64;
        }

        // 每 3 秒发送一条演示消息
        if last_demo.elapsed() >= Duration::from_secs(3) {
            tx_counter += 1;
            let msg = format!(
                "Demo TX #{} - uptime {}s\r\n",
                tx_counter,
                started.elapsed().as_secs()
            );
            terminal.write(msg.as_bytes());
            tx_bytes_total += msg.len() as u64;
            last_demo = Instant::now();
        }

        // 每 5 秒打印一次统计
        if last_stats.elapsed() >= Duration::from_secs(5) {
            println!(
                "--- 统计 (运行 {}s) RX: {} bytes, TX: {} bytes ---",
                started.elapsed().as_secs(),
                rx_bytes_total,
                tx_bytes_total
            );
            last_stats = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(100));
    }
}
