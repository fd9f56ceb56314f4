//! UDP 服务端
//!
//! 每个数据报视为一条消息。UDP 无连接，服务端记住发过数据的来源地址，
//! 广播和定向发送都只面向这些已知来源。

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{
    codec, ConnectionRegistry, ConnectionStats, Emitter, Message, PayloadKind, PeerIdentity,
    ProtocolError, ProtocolKind, Result, ServerConfig, TransportEvent, TransportServer,
    MAX_DATAGRAM_SIZE,
};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};

use crate::control::{Command, ServerCore};

/// UDP 服务端
pub struct UdpServer {
    core: ServerCore,
}

impl UdpServer {
    pub fn new(config: ServerConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            core: ServerCore::new(ProtocolKind::Udp, config, events),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }
}

impl TransportServer for UdpServer {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Udp
    }

    async fn start(&mut self, port: u16) -> Result<SocketAddr> {
        self.core.stop().await;

        let socket = UdpSocket::bind(self.core.config.bind_addr(port))
            .await
            .map_err(|e| self.core.setup_failed(port, e.into()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| self.core.setup_failed(port, e.into()))?;

        let (commands_tx, commands) = ServerCore::command_channel();
        let dispatch = Dispatch {
            socket,
            senders: ConnectionRegistry::new(self.core.config.max_clients),
            config: self.core.config.clone(),
            emitter: self.core.emitter.clone(),
            stats: Arc::clone(&self.core.stats),
            format: self.core.format_rx(),
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

struct Dispatch {
    socket: UdpSocket,
    /// 已知来源地址
    senders: ConnectionRegistry<SocketAddr>,
    config: ServerConfig,
    emitter: Emitter,
    stats: Arc<ConnectionStats>,
    format: watch::Receiver<PayloadKind>,
    commands: mpsc::Receiver<Command>,
}

impl Dispatch {
    async fn run(mut self) {
        let period = self.config.sweep_interval;
        let mut sweep = interval_at(Instant::now() + period, period);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                ready = self.socket.readable() => {
                    match ready {
                        Ok(()) => self.drain_datagrams(&mut buf),
                        Err(e) => self.emitter.error(format!("Receive error: {e}")),
                    }
                }

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.on_command(command).await,
                    }
                }

                _ = sweep.tick() => self.sweep(),
            }
        }

        self.senders.drain();
    }

    /// 读出当前已就绪的全部数据报
    fn drain_datagrams(&mut self, buf: &mut [u8]) {
        loop {
            match self.socket.try_recv_from(buf) {
                Ok((n, addr)) => self.on_datagram(&buf[..n], addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // ICMP 端口不可达等错误不影响后续接收
                    debug!("UDP receive error: {}", e);
                    break;
                }
            }
        }
    }

    fn on_datagram(&mut self, data: &[u8], addr: SocketAddr) {
        let peer = PeerIdentity::from(addr);
        let now = Instant::now();
        if !self.senders.touch(&peer, now) {
            match self.senders.register(peer.clone(), addr, now) {
                Ok(()) => debug!("New UDP sender {}", peer),
                Err((e, _)) => debug!("Not tracking UDP sender {}: {}", peer, e),
            }
        }

        let format = *self.format.borrow();
        if let Some(message) = codec::decode_line(data, format, self.config.auto_detect) {
            self.stats.record_received();
            self.emitter.message(message, peer.to_string());
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SendToAll { message, reply } => {
                let _ = reply.send(self.broadcast(&message).await);
            }
            Command::SendToPeer {
                peer,
                message,
                reply,
            } => {
                let _ = reply.send(self.send_to(&peer, &message).await);
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.senders.identities());
            }
            Command::Shutdown => {}
        }
    }

    async fn broadcast(&mut self, message: &Message) -> Result<usize> {
        if self.senders.is_empty() {
            info!("No known UDP senders, broadcast skipped");
            return Ok(0);
        }

        let bytes = codec::frame_line(message);
        let targets: Vec<SocketAddr> = self.senders.iter_mut().map(|(_, addr)| *addr).collect();
        let mut delivered = 0;
        for addr in targets {
            match send_datagram(&self.socket, &bytes, addr).await {
                Ok(()) => {
                    delivered += 1;
                    self.stats.record_sent();
                }
                Err(e) => self.emitter.error(format!("Failed to send to {addr}: {e}")),
            }
        }
        Ok(delivered)
    }

    async fn send_to(&mut self, peer: &PeerIdentity, message: &Message) -> Result<()> {
        let addr = *self.senders.require_mut(peer)?;
        let bytes = codec::frame_line(message);
        match send_datagram(&self.socket, &bytes, addr).await {
            Ok(()) => {
                self.stats.record_sent();
                Ok(())
            }
            Err(e) => {
                self.emitter.error(format!("Failed to send to {peer}: {e}"));
                Err(e)
            }
        }
    }

    /// 遗忘长时间没有数据的来源
    fn sweep(&mut self) {
        for peer in self
            .senders
            .idle_peers(Instant::now(), self.config.idle_timeout)
        {
            self.senders.remove(&peer);
            debug!("Forgot idle UDP sender {}", peer);
        }
    }
}

/// 发送一个数据报，未完整发出视为错误
async fn send_datagram(socket: &UdpSocket, bytes: &[u8], addr: SocketAddr) -> Result<()> {
    let written = socket.send_to(bytes, addr).await?;
    if written != bytes.len() {
        return Err(ProtocolError::PartialWrite {
            written,
            expected: bytes.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{config, next_event};
    use protocol::event_channel;
    use serde_json::json;
    use std::time::Duration;

    async fn started() -> (UdpServer, SocketAddr, protocol::EventReceiver) {
        let (tx, rx) = event_channel();
        let mut server = UdpServer::new(config(), tx);
        let addr = server.start(0).await.unwrap();
        (server, addr, rx)
    }

    async fn recv_text(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 1024];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn test_datagram_becomes_message_and_reply_reaches_sender() {
        let (mut server, addr, mut rx) = started().await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = client.local_addr().unwrap();
        client.send_to(b"{\"n\":1}\n", addr).await.unwrap();

        match next_event(&mut rx).await {
            TransportEvent::Message {
                protocol,
                message,
                source,
                ..
            } => {
                assert_eq!(protocol, ProtocolKind::Udp);
                assert_eq!(message.as_json().unwrap()["n"], 1);
                assert_eq!(source, local.to_string());
            }
            other => panic!("Unexpected event: {other:?}"),
        }

        let peer = PeerIdentity::from(local);
        assert_eq!(server.peers().await.unwrap(), vec![peer.clone()]);
        server
            .send_to_peer(&peer, &Message::structured(json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(recv_text(&client).await, "{\"ok\":true}\n");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_without_senders_is_noop() {
        let (mut server, _addr, mut rx) = started().await;
        let delivered = server
            .send_to_all(&Message::plain_text("hello"))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_known_senders() {
        let (mut server, addr, mut rx) = started().await;

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(b"from a", addr).await.unwrap();
        next_event(&mut rx).await;
        b.send_to(b"from b", addr).await.unwrap();
        next_event(&mut rx).await;

        server.set_format(PayloadKind::PlainText);
        let delivered = server
            .send_to_all(&Message::plain_text("all"))
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(recv_text(&a).await, "all\n");
        assert_eq!(recv_text(&b).await, "all\n");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_sender() {
        let (mut server, _addr, _rx) = started().await;
        let result = server
            .send_to_peer(&PeerIdentity::from("127.0.0.1:9"), &Message::plain_text("x"))
            .await;
        assert!(matches!(result, Err(ProtocolError::PeerNotFound(_))));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_raw_bytes_datagram_kept_intact() {
        let (mut server, addr, mut rx) = started().await;
        server.set_format(PayloadKind::RawBytes);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0x00, 0x0a, 0xff], addr).await.unwrap();
        match next_event(&mut rx).await {
            TransportEvent::Message { message, .. } => {
                assert_eq!(message.as_bytes(), Some(&[0x00, 0x0a, 0xff][..]));
            }
            other => panic!("Unexpected event: {other:?}"),
        }
        server.stop().await;
    }
}
