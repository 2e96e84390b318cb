//! TCP 传输实现
//!
//! 运行一个 TCP 服务器，支持任意数量的并发客户端：
//! 任一客户端发来的数据汇入同一条逻辑入站通道（不区分来源），
//! 出站数据广播给所有当前连接的客户端。
//!
//! 单个客户端的读写错误只影响该客户端（按断开处理），
//! 服务器和其余客户端不受影响。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::utils::error::TerminalError;

use super::{Endpoint, RxCallback, Transport, READ_CHUNK_SIZE};

/// 客户端注册表：连接标识 -> 写半端
///
/// 条目在 accept 时加入，在断开或写失败时移除；
/// 移除是释放连接资源的唯一路径。
type ClientRegistry = Arc<Mutex<HashMap<Uuid, OwnedWriteHalf>>>;

/// TCP 传输
pub struct TcpTransport {
    host: String,
    port: u16,
    on_rx: RxCallback,
    running: bool,
    /// 实际监听端口（port = 0 时由系统分配，启动后可查询）
    local_port: Option<u16>,
    listener: Option<Arc<TcpListener>>,
    clients: ClientRegistry,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// 创建新的 TCP 传输（不启动）
    pub fn new(on_rx: RxCallback, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            on_rx,
            running: false,
            local_port: None,
            listener: None,
            clients: Arc::new(Mutex::new(HashMap::new())),
            accept_task: None,
        }
    }

    /// 当前连接的客户端数量
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// 单个客户端的读循环
    ///
    /// 每个非空块转发给回调；EOF 或读错误只移除该客户端。
    async fn client_read_loop(
        id: Uuid,
        mut reader: OwnedReadHalf,
        clients: ClientRegistry,
        on_rx: RxCallback,
    ) {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::info!("客户端断开: {}", id);
                    break;
                }
                Ok(n) => {
                    on_rx.deliver(&buf[..n]);
                }
                Err(e) => {
                    tracing::warn!("客户端 {} 读错误: {}", id, e);
                    break;
                }
            }
        }

        // 移除自身并关闭写半端
        if let Some(mut writer) = clients.lock().await.remove(&id) {
            let _ = writer.shutdown().await;
        }
    }

    /// accept 循环
    ///
    /// 持续接受新连接，为每个连接启动专属读循环。
    /// 读循环任务挂在 JoinSet 上，accept 任务被取消时一并中止。
    async fn accept_loop(
        listener: Arc<TcpListener>,
        clients: ClientRegistry,
        on_rx: RxCallback,
    ) {
        let mut readers: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let id = Uuid::new_v4();
                            tracing::info!("客户端连接: {} ({})", addr, id);

                            let (reader, writer) = stream.into_split();
                            clients.lock().await.insert(id, writer);
                            readers.spawn(Self::client_read_loop(
                                id,
                                reader,
                                clients.clone(),
                                on_rx.clone(),
                            ));
                        }
                        Err(e) => {
                            // 单次 accept 失败（如 EMFILE）不终止服务器
                            tracing::warn!("accept 失败: {}", e);
                        }
                    }
                }
                // 回收已结束的读循环任务
                Some(_) = readers.join_next() => {}
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn start(&mut self) -> Result<(), TerminalError> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| TerminalError::bind_failed(&self.host, self.port, e))?;

        let actual_port = listener
            .local_addr()
            .map_err(|e| TerminalError::bind_failed(&self.host, self.port, e))?
            .port();

        let listener = Arc::new(listener);
        self.accept_task = Some(tokio::spawn(Self::accept_loop(
            listener.clone(),
            self.clients.clone(),
            self.on_rx.clone(),
        )));

        self.listener = Some(listener);
        self.local_port = Some(actual_port);
        self.running = true;

        tracing::info!("TCP 终端就绪: {}:{}", self.host, actual_port);
        Ok(())
    }

    async fn stop(&mut self) {
        self.running = false;

        // 先停止接受新连接（同时中止所有客户端读循环），
        // 再关闭已注册的客户端，最后关闭监听 socket，
        // 避免新客户端与关闭过程竞争。
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }

        let mut clients = self.clients.lock().await;
        for (id, mut writer) in clients.drain() {
            if let Err(e) = writer.shutdown().await {
                tracing::warn!("关闭客户端 {} 失败: {}", id, e);
            }
        }
        drop(clients);

        self.listener = None;
        self.local_port = None;
        tracing::info!("TCP 终端已停止");
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        if !self.running {
            return Ok(());
        }

        // 广播给所有客户端；单个客户端写失败按断开处理，
        // 不影响其余客户端的投递。
        let mut clients = self.clients.lock().await;
        let mut dead = Vec::new();
        for (id, writer) in clients.iter_mut() {
            if let Err(e) = writer.write_all(data).await {
                tracing::warn!("写入客户端 {} 失败，移除: {}", id, e);
                dead.push(*id);
            }
        }
        for id in dead {
            clients.remove(&id);
        }
        Ok(())
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.local_port.map(Endpoint::TcpPort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn channel_callback() -> (RxCallback, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cb = RxCallback::new(move |data: &[u8]| {
            let _ = tx.send(data.to_vec());
        });
        (cb, rx)
    }

    async fn start_transport(on_rx: RxCallback) -> (TcpTransport, u16) {
        let mut transport = TcpTransport::new(on_rx, "127.0.0.1", 0);
        transport.start().await.unwrap();
        let port = match transport.endpoint() {
            Some(Endpoint::TcpPort(p)) => p,
            other => panic!("unexpected endpoint: {:?}", other),
        };
        assert!(port > 0);
        (transport, port)
    }

    async fn wait_for_clients(transport: &TcpTransport, expected: usize) {
        for _ in 0..100 {
            if transport.client_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} clients, got {}",
            expected,
            transport.client_count().await
        );
    }

    async fn read_exact_bytes(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut received = vec![0u8; len];
        timeout(Duration::from_secs(5), stream.read_exact(&mut received))
            .await
            .expect("read timed out")
            .expect("read failed");
        received
    }

    #[tokio::test]
    async fn test_ephemeral_port_and_ping() {
        let (cb, mut rx) = channel_callback();
        let (mut transport, port) = start_transport(cb).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let received = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("callback timed out")
            .unwrap();
        assert_eq!(received, b"ping");

        // 只投递一次
        assert!(rx.try_recv().is_err());

        transport.stop().await;
    }

    #[tokio::test]
    async fn test_payload_integrity_64k() {
        let (cb, _rx) = channel_callback();
        let (mut transport, port) = start_transport(cb).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_clients(&transport, 1).await;

        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        transport.write(&payload).await.unwrap();

        let received = read_exact_bytes(&mut client, payload.len()).await;
        assert_eq!(received, payload);

        transport.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let (cb, _rx) = channel_callback();
        let (mut transport, port) = start_transport(cb).await;

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        }
        wait_for_clients(&transport, 3).await;

        let msg = b"Broadcast message";
        transport.write(msg).await.unwrap();

        for client in clients.iter_mut() {
            let received = read_exact_bytes(client, msg.len()).await;
            assert_eq!(received, msg);
        }

        transport.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_does_not_affect_others() {
        let (cb, _rx) = channel_callback();
        let (mut transport, port) = start_transport(cb).await;

        let mut keep = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let drop_client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_clients(&transport, 2).await;

        drop(drop_client);
        wait_for_clients(&transport, 1).await;

        transport.write(b"after disconnect").await.unwrap();
        let received = read_exact_bytes(&mut keep, 16).await;
        assert_eq!(received, b"after disconnect");

        // 之后还能接入新客户端并收到后续写入
        let mut late = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_clients(&transport, 2).await;

        transport.write(b"late join").await.unwrap();
        let received = read_exact_bytes(&mut late, 9).await;
        assert_eq!(received, b"late join");

        transport.stop().await;
    }

    #[tokio::test]
    async fn test_fan_in_from_multiple_clients() {
        let (cb, mut rx) = channel_callback();
        let (mut transport, port) = start_transport(cb).await;

        let mut c1 = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut c2 = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_clients(&transport, 2).await;

        c1.write_all(b"from-one").await.unwrap();
        c2.write_all(b"from-two").await.unwrap();

        // 两个客户端的数据都汇入同一条入站通道（顺序不保证）
        let mut seen = Vec::new();
        for _ in 0..2 {
            let chunk = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("callback timed out")
                .unwrap();
            seen.push(chunk);
        }
        seen.sort();
        assert_eq!(seen, vec![b"from-one".to_vec(), b"from-two".to_vec()]);

        transport.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let (cb, _rx) = channel_callback();
        let mut transport = TcpTransport::new(cb, "127.0.0.1", 0);
        // start 从未成功时 stop 也必须安全
        transport.stop().await;
        assert!(transport.endpoint().is_none());
    }

    #[tokio::test]
    async fn test_stop_closes_clients_and_port() {
        let (cb, _rx) = channel_callback();
        let (mut transport, port) = start_transport(cb).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for_clients(&transport, 1).await;

        transport.stop().await;
        assert!(transport.endpoint().is_none());

        // 客户端应观察到 EOF
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("read timed out")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_bind_failure_reports_acquisition_error() {
        let (cb, _rx) = channel_callback();
        // 先占住一个端口
        let holder = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let mut transport = TcpTransport::new(cb, "127.0.0.1", port);
        let err = transport.start().await.unwrap_err();
        assert!(err.is_acquisition_error());
        assert!(transport.endpoint().is_none());
    }
}
