//! UDP 客户端
//!
//! 没有握手：`connect` 只解析并记录目标地址，绑定一个临时本地端口。

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{
    codec, parse_endpoint, ClientConfig, ConnectionStats, Message, PayloadKind, ProtocolError,
    ProtocolKind, Result, TransportClient, TransportEvent, MAX_DATAGRAM_SIZE,
};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tracing::debug;

use crate::state::{ClientCore, Link};

/// UDP 客户端
pub struct UdpClient {
    core: ClientCore,
    socket: Option<Arc<UdpSocket>>,
    target: Option<SocketAddr>,
}

impl UdpClient {
    pub fn new(config: ClientConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            core: ClientCore::new(ProtocolKind::Udp, config, events),
            socket: None,
            target: None,
        }
    }

    /// 本地绑定地址
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    async fn resolve(endpoint: &str) -> Result<(SocketAddr, UdpSocket)> {
        let (host, port) = parse_endpoint(endpoint)?;
        let target = lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| ProtocolError::InvalidEndpoint(endpoint.to_string()))?;
        let local = if target.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local).await?;
        Ok((target, socket))
    }
}

impl TransportClient for UdpClient {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Udp
    }

    async fn connect(&mut self, endpoint: &str) -> Result<()> {
        self.disconnect().await;

        let (target, socket) = Self::resolve(endpoint)
            .await
            .map_err(|e| self.core.connect_failed(endpoint, e))?;
        let socket = Arc::new(socket);

        let link = self.core.open(endpoint);
        let reader = tokio::spawn(read_loop(link, Arc::clone(&socket)));
        self.core.attach(reader);
        self.socket = Some(socket);
        self.target = Some(target);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.core.close().await;
        self.socket = None;
        self.target = None;
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        self.core.require_connected()?;
        let (Some(socket), Some(target)) = (self.socket.as_ref(), self.target) else {
            return Err(ProtocolError::NotConnected);
        };

        let bytes = codec::frame_line(message);
        let result = match socket.send_to(&bytes, target).await {
            Ok(written) if written == bytes.len() => Ok(()),
            Ok(written) => Err(ProtocolError::PartialWrite {
                written,
                expected: bytes.len(),
            }),
            Err(e) => Err(e.into()),
        };
        match &result {
            Ok(()) => {
                self.core.stats.record_sent();
                debug!("Sent {} byte datagram to {}", bytes.len(), target);
            }
            Err(e) => self.core.emitter.error(format!("Failed to send to {target}: {e}")),
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
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

/// 每次可读时读出全部排队的数据报
async fn read_loop(link: Link, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        if let Err(e) = socket.readable().await {
            link.emitter.error(format!("Receive error: {e}"));
            break;
        }
        loop {
            match socket.try_recv_from(&mut buf) {
                Ok((n, from)) => link.deliver(&buf[..n], &from.to_string()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("UDP receive error: {}", e);
                    break;
                }
            }
        }
    }
    link.closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{event_channel, EventReceiver};
    use std::time::Duration;

    async fn next_event(rx: &mut EventReceiver) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_datagram_exchange() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (tx, mut rx) = event_channel();
        let mut client = UdpClient::new(ClientConfig::default(), tx);
        client.set_format(PayloadKind::PlainText);

        client.connect(&server_addr.to_string()).await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Connected { .. }
        ));

        client.send(&Message::plain_text("ping")).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping\n");

        // 两个数据报在同一次可读事件中被读出
        server.send_to(b"one\n", from).await.unwrap();
        server.send_to(b"two\n", from).await.unwrap();
        for expected in ["one", "two"] {
            match next_event(&mut rx).await {
                TransportEvent::Message {
                    message, source, ..
                } => {
                    assert_eq!(message.as_text(), Some(expected));
                    assert_eq!(source, server_addr.to_string());
                }
                other => panic!("Unexpected event: {other:?}"),
            }
        }

        client.disconnect().await;
        assert!(!client.is_connected());
        assert!(client.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_raw_bytes_sent_without_newline() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, _rx) = event_channel();
        let mut client = UdpClient::new(ClientConfig::default(), tx);
        client
            .connect(&server.local_addr().unwrap().to_string())
            .await
            .unwrap();

        client
            .send(&Message::raw_bytes(vec![0xde, 0xad]))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0xde, 0xad]);
    }
}
