//! TCP 服务端
//!
//! 一次读取视为一条消息，发送时在消息末尾追加换行符。

use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{
    codec, ConnectionRegistry, ConnectionStats, Emitter, Message, PayloadKind, PeerIdentity,
    ProtocolError, ProtocolKind, Result, ServerConfig, TransportEvent, TransportServer,
    READ_BUFFER_SIZE,
};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::control::{Command, ServerCore};
use crate::writer::PeerWriter;

/// TCP 服务端
pub struct TcpServer {
    core: ServerCore,
}

impl TcpServer {
    pub fn new(config: ServerConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            core: ServerCore::new(ProtocolKind::Tcp, config, events),
        }
    }

    /// 实际绑定的地址
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }
}

impl TransportServer for TcpServer {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Tcp
    }

    async fn start(&mut self, port: u16) -> Result<SocketAddr> {
        self.core.stop().await;

        let listener = TcpListener::bind(self.core.config.bind_addr(port))
            .await
            .map_err(|e| self.core.setup_failed(port, e.into()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| self.core.setup_failed(port, e.into()))?;

        let (commands_tx, commands) = ServerCore::command_channel();
        let (input_tx, input) = mpsc::unbounded_channel();
        let dispatch = Dispatch {
            listener,
            registry: ConnectionRegistry::new(self.core.config.max_clients),
            config: self.core.config.clone(),
            emitter: self.core.emitter.clone(),
            stats: Arc::clone(&self.core.stats),
            format: self.core.format_rx(),
            input_tx,
            input,
            commands,
        };
        let task = tokio::spawn(dispatch.run());
        self.core.launch(local_addr, commands_tx, task);
        Ok(local_addr)
    }

    async fn stop(&mut self) {
        self.core.stop().await;
    }

    fn is_listening(&self) -> bool {
        self.core.is_listening()
    }

    async fn send_to_all(&self, message: &Message) -> Result<usize> {
        self.core.send_to_all(message).await
    }

    async fn send_to_peer(&self, peer: &PeerIdentity, message: &Message) -> Result<()> {
        self.core.send_to_peer(peer, message).await
    }

    async fn peers(&self) -> Result<Vec<PeerIdentity>> {
        self.core.peers().await
    }

    fn set_format(&self, kind: PayloadKind) {
        self.core.set_format(kind);
    }

    fn format(&self) -> PayloadKind {
        self.core.format()
    }

    fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.core.stats)
    }
}

/// 读取任务转发给调度任务的输入
#[derive(Debug)]
enum Input {
    Data { peer: PeerIdentity, data: Vec<u8> },
    Closed { peer: PeerIdentity, error: Option<String> },
    WriteFailed { peer: PeerIdentity, error: String },
}

/// 一个已接入的连接，丢弃即关闭
struct Peer {
    writer: PeerWriter<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// 调度任务：独占监听套接字与注册表
struct Dispatch {
    listener: TcpListener,
    registry: ConnectionRegistry<Peer>,
    config: ServerConfig,
    emitter: Emitter,
    stats: Arc<ConnectionStats>,
    format: watch::Receiver<PayloadKind>,
    input_tx: mpsc::UnboundedSender<Input>,
    input: mpsc::UnboundedReceiver<Input>,
    commands: mpsc::Receiver<Command>,
}

impl Dispatch {
    async fn run(mut self) {
        let period = self.config.sweep_interval;
        let mut sweep = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                // 接受新连接
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.on_accept(stream, addr),
                        Err(e) => self.emitter.error(format!("Failed to accept connection: {e}")),
                    }
                }

                // 读取任务转发的数据
                Some(input) = self.input.recv() => self.on_input(input),

                // 外部命令
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.on_command(command),
                    }
                }

                // 空闲扫描
                _ = sweep.tick() => self.sweep(),
            }
        }

        for (peer, handle) in self.registry.drain() {
            drop(handle);
            self.emitter.peer_disconnected(&peer);
        }
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let peer = PeerIdentity::from(addr);
        if self.registry.is_full() {
            drop(stream);
            self.emitter.error(format!(
                "Rejected {peer}: {}",
                ProtocolError::CapacityExceeded {
                    max: self.registry.max_clients()
                }
            ));
            return;
        }

        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
            debug!("Failed to set nodelay for {}: {}", peer, e);
        }
        let (reader, writer) = stream.into_split();
        let reader = tokio::spawn(read_loop(peer.clone(), reader, self.input_tx.clone()));
        let input = self.input_tx.clone();
        let writer = PeerWriter::spawn(
            peer.clone(),
            writer,
            self.config.write_timeout,
            move |peer, error| {
                let _ = input.send(Input::WriteFailed { peer, error });
            },
        );

        match self
            .registry
            .register(peer.clone(), Peer { writer, reader }, Instant::now())
        {
            Ok(()) => {
                info!("New TCP connection from {}", peer);
                self.emitter.peer_connected(&peer);
            }
            Err((e, handle)) => {
                drop(handle);
                self.emitter.error(format!("Rejected {peer}: {e}"));
            }
        }
    }

    fn on_input(&mut self, input: Input) {
        match input {
            Input::Data { peer, data } => {
                // 已被移除的对端不再产生消息
                if !self.registry.touch(&peer, Instant::now()) {
                    return;
                }
                let format = *self.format.borrow();
                if let Some(message) = codec::decode_line(&data, format, self.config.auto_detect) {
                    self.stats.record_received();
                    self.emitter.message(message, peer.to_string());
                }
            }
            Input::Closed { peer, error } => {
                if self.registry.remove(&peer).is_some() {
                    match error {
                        Some(e) => warn!("TCP connection {} closed with error: {}", peer, e),
                        None => info!("TCP connection {} closed", peer),
                    }
                    self.emitter.peer_disconnected(&peer);
                }
            }
            Input::WriteFailed { peer, error } => {
                self.drop_peer(&peer, format!("Failed to send to {peer}: {error}"));
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SendToAll { message, reply } => {
                let _ = reply.send(self.broadcast(&message));
            }
            Command::SendToPeer {
                peer,
                message,
                reply,
            } => {
                let _ = reply.send(self.send_to(&peer, &message));
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.registry.identities());
            }
            Command::Shutdown => {}
        }
    }

    /// 放入每个对端的写队列，不等待写出
    fn broadcast(&mut self, message: &Message) -> Result<usize> {
        if self.registry.is_empty() {
            self.emitter.error(ProtocolError::NoPeers);
            return Err(ProtocolError::NoPeers);
        }

        let bytes = codec::frame_line(message);
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (peer, handle) in self.registry.iter_mut() {
            match handle.writer.push(bytes.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((peer.clone(), e)),
            }
        }
        for (peer, e) in failed {
            self.drop_peer(&peer, format!("Failed to send to {peer}: {e}"));
        }

        for _ in 0..delivered {
            self.stats.record_sent();
        }
        debug!("Broadcast to {} TCP peers", delivered);
        Ok(delivered)
    }

    fn send_to(&mut self, peer: &PeerIdentity, message: &Message) -> Result<()> {
        let handle = self.registry.require_mut(peer)?;
        match handle.writer.push(codec::frame_line(message)) {
            Ok(()) => {
                self.stats.record_sent();
                Ok(())
            }
            Err(e) => {
                self.drop_peer(peer, format!("Failed to send to {peer}: {e}"));
                Err(e)
            }
        }
    }

    /// 因错误移除对端
    fn drop_peer(&mut self, peer: &PeerIdentity, description: String) {
        if self.registry.remove(peer).is_some() {
            self.emitter.error(description);
            self.emitter.peer_disconnected(peer);
        }
    }

    /// 断开空闲超时的对端
    fn sweep(&mut self) {
        let timeout = self.config.idle_timeout;
        for peer in self.registry.idle_peers(Instant::now(), timeout) {
            self.drop_peer(
                &peer,
                format!(
                    "Client {peer} disconnected due to inactivity ({}s idle)",
                    timeout.as_secs()
                ),
            );
        }
    }
}

/// 读取任务：只负责把收到的字节转发给调度任务
async fn read_loop(
    peer: PeerIdentity,
    mut reader: OwnedReadHalf,
    input: mpsc::UnboundedSender<Input>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = input.send(Input::Closed { peer, error: None });
                break;
            }
            Ok(n) => {
                let data = buf[..n].to_vec();
                if input
                    .send(Input::Data {
                        peer: peer.clone(),
                        data,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                let _ = input.send(Input::Closed {
                    peer,
                    error: Some(e.to_string()),
                });
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{config, next_event, next_matching};
    use protocol::event_channel;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncBufReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::io::BufReader;

    async fn started(config: ServerConfig) -> (TcpServer, SocketAddr, protocol::EventReceiver) {
        let (tx, rx) = event_channel();
        let mut server = TcpServer::new(config, tx);
        let addr = server.start(0).await.unwrap();
        (server, addr, rx)
    }

    #[tokio::test]
    async fn test_receives_structured_line() {
        let (mut server, addr, mut rx) = started(config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let local = client.local_addr().unwrap();
        let joined = next_event(&mut rx).await;
        assert!(
            matches!(joined, TransportEvent::PeerConnected { ref peer, .. } if peer.as_str() == local.to_string())
        );

        client.write_all(b"{\"type\":\"hello\"}\n").await.unwrap();
        match next_event(&mut rx).await {
            TransportEvent::Message {
                protocol,
                message,
                source,
                ..
            } => {
                assert_eq!(protocol, ProtocolKind::Tcp);
                assert_eq!(message.kind(), PayloadKind::Structured);
                assert_eq!(message.as_json().unwrap()["type"], "hello");
                assert_eq!(source, local.to_string());
            }
            other => panic!("Unexpected event: {other:?}"),
        }
        assert_eq!(server.stats().received(), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_capacity_rejects_extra_peer() {
        let mut cfg = config();
        cfg.max_clients = 2;
        let (mut server, addr, mut rx) = started(cfg).await;

        let a = TcpStream::connect(addr).await.unwrap();
        next_matching(&mut rx, |e| matches!(e, TransportEvent::PeerConnected { .. })).await;
        let b = TcpStream::connect(addr).await.unwrap();
        next_matching(&mut rx, |e| matches!(e, TransportEvent::PeerConnected { .. })).await;

        let mut c = TcpStream::connect(addr).await.unwrap();
        let rejected = next_event(&mut rx).await;
        assert!(
            matches!(rejected, TransportEvent::Error { ref description, .. } if description.contains("Maximum clients reached (2)"))
        );

        // 被拒绝的连接立即关闭
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), c.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        assert_eq!(server.peers().await.unwrap().len(), 2);
        let delivered = server
            .send_to_all(&Message::plain_text("broadcast"))
            .await
            .unwrap();
        assert_eq!(delivered, 2);

        for stream in [a, b] {
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).await.unwrap();
            assert_eq!(line, "broadcast\n");
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails_without_events() {
        let (mut server, _addr, mut rx) = started(config()).await;

        let result = server
            .send_to_peer(&PeerIdentity::from("10.9.9.9:1"), &Message::plain_text("x"))
            .await;
        assert!(matches!(result, Err(ProtocolError::PeerNotFound(_))));
        assert!(rx.try_recv().is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_with_no_peers_reports_error() {
        let (mut server, _addr, mut rx) = started(config()).await;

        let result = server
            .send_to_all(&Message::structured(json!({"a": 1})))
            .await;
        assert!(matches!(result, Err(ProtocolError::NoPeers)));
        assert!(
            matches!(next_event(&mut rx).await, TransportEvent::Error { description, .. } if description == "no peers to broadcast to")
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_peer_reaches_only_that_peer() {
        let (mut server, addr, mut rx) = started(config()).await;

        let target = TcpStream::connect(addr).await.unwrap();
        let peer = PeerIdentity::from(target.local_addr().unwrap());
        next_matching(&mut rx, |e| matches!(e, TransportEvent::PeerConnected { .. })).await;

        server
            .send_to_peer(&peer, &Message::structured(json!({"to": "you"})))
            .await
            .unwrap();
        let mut line = String::new();
        BufReader::new(target).read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"to\":\"you\"}\n");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_idle_peer_is_evicted_active_peer_kept() {
        let mut cfg = config();
        cfg.idle_timeout = Duration::from_millis(300);
        cfg.sweep_interval = Duration::from_millis(100);
        let (mut server, addr, mut rx) = started(cfg).await;

        let idle = TcpStream::connect(addr).await.unwrap();
        let idle_peer = PeerIdentity::from(idle.local_addr().unwrap());
        next_matching(&mut rx, |e| matches!(e, TransportEvent::PeerConnected { .. })).await;
        let mut active = TcpStream::connect(addr).await.unwrap();
        let active_peer = PeerIdentity::from(active.local_addr().unwrap());
        next_matching(&mut rx, |e| matches!(e, TransportEvent::PeerConnected { .. })).await;

        // active 每 100ms 发一次数据
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            active.write_all(b"ping\n").await.unwrap();
        }

        let evicted = next_matching(&mut rx, |e| {
            matches!(e, TransportEvent::PeerDisconnected { .. })
        })
        .await;
        assert!(
            matches!(evicted, TransportEvent::PeerDisconnected { ref peer, .. } if *peer == idle_peer)
        );
        assert_eq!(server.peers().await.unwrap(), vec![active_peer]);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_peer_close_emits_disconnect() {
        let (mut server, addr, mut rx) = started(config()).await;

        let client = TcpStream::connect(addr).await.unwrap();
        let peer = PeerIdentity::from(client.local_addr().unwrap());
        next_matching(&mut rx, |e| matches!(e, TransportEvent::PeerConnected { .. })).await;
        drop(client);

        let event = next_event(&mut rx).await;
        assert!(matches!(event, TransportEvent::PeerDisconnected { peer: ref p, .. } if *p == peer));
        assert!(server.peers().await.unwrap().is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (mut server, _addr, _rx) = started(config()).await;
        assert!(server.is_listening());
        server.stop().await;
        server.stop().await;
        assert!(!server.is_listening());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_bind_failure_reports_error() {
        let (mut first, addr, _rx) = started(config()).await;

        let (tx, mut rx) = event_channel();
        let mut second = TcpServer::new(config(), tx);
        assert!(second.start(addr.port()).await.is_err());
        assert!(!second.is_listening());
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Error { .. }));
        first.stop().await;
    }

    #[tokio::test]
    async fn test_format_change_applies_to_inbound() {
        let (mut server, addr, mut rx) = started(config()).await;
        server.set_format(PayloadKind::Tabular);
        assert_eq!(server.format(), PayloadKind::Tabular);

        let mut client = TcpStream::connect(addr).await.unwrap();
        next_matching(&mut rx, |e| matches!(e, TransportEvent::PeerConnected { .. })).await;
        client.write_all(b"a,b,c\n").await.unwrap();

        match next_event(&mut rx).await {
            TransportEvent::Message { message, .. } => {
                assert_eq!(message.kind(), PayloadKind::Tabular);
                assert_eq!(message.as_text(), Some("a,b,c"));
            }
            other => panic!("Unexpected event: {other:?}"),
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stalled_reader_does_not_block_other_peers() {
        let mut cfg = config();
        cfg.write_timeout = Duration::from_secs(30);
        let (mut server, addr, mut rx) = started(cfg).await;

        let stalled = TcpStream::connect(addr).await.unwrap();
        let stalled_peer = PeerIdentity::from(stalled.local_addr().unwrap());
        next_matching(&mut rx, |e| matches!(e, TransportEvent::PeerConnected { .. })).await;

        // 对端从不读取：内核缓冲区写满后写队列随之写满，之后该对端被断开
        let chunk = Message::raw_bytes(vec![0u8; 256 * 1024]);
        let mut last = Ok(());
        for _ in 0..200 {
            last = tokio::time::timeout(
                Duration::from_secs(1),
                server.send_to_peer(&stalled_peer, &chunk),
            )
            .await
            .expect("send_to_peer blocked behind a stalled peer");
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(ProtocolError::QueueFull(_))));
        let error = next_matching(&mut rx, |e| matches!(e, TransportEvent::Error { .. })).await;
        assert!(
            matches!(error, TransportEvent::Error { ref description, .. } if description.contains("Send queue full"))
        );
        let dropped = next_event(&mut rx).await;
        assert!(
            matches!(dropped, TransportEvent::PeerDisconnected { ref peer, .. } if *peer == stalled_peer)
        );

        let mut other = TcpStream::connect(addr).await.unwrap();
        let other_peer = other.local_addr().unwrap().to_string();
        next_matching(&mut rx, |e| matches!(e, TransportEvent::PeerConnected { .. })).await;
        other.write_all(b"still here\n").await.unwrap();
        let received = next_matching(&mut rx, |e| matches!(e, TransportEvent::Message { .. })).await;
        assert!(
            matches!(received, TransportEvent::Message { ref source, .. } if *source == other_peer)
        );

        let peers = tokio::time::timeout(Duration::from_secs(1), server.peers())
            .await
            .expect("peers() blocked")
            .unwrap();
        assert_eq!(peers.len(), 1);
        tokio::time::timeout(Duration::from_secs(5), server.stop())
            .await
            .expect("stop() blocked");
        drop(stalled);
    }
}
