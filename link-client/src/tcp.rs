//! TCP 客户端

use std::sync::Arc;

use protocol::{
    codec, parse_endpoint, ClientConfig, ConnectionStats, Message, PayloadKind, ProtocolError,
    ProtocolKind, Result, TransportClient, TransportEvent, READ_BUFFER_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::state::{ClientCore, Link};

/// TCP 客户端
///
/// 一次读取视为一条消息，发送时追加换行符。
pub struct TcpClient {
    core: ClientCore,
    writer: Option<OwnedWriteHalf>,
}

impl TcpClient {
    pub fn new(config: ClientConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            core: ClientCore::new(ProtocolKind::Tcp, config, events),
            writer: None,
        }
    }

    async fn establish(&self, endpoint: &str) -> Result<TcpStream> {
        let (host, port) = parse_endpoint(endpoint)?;
        let stream = timeout(
            self.core.config.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| ProtocolError::ConnectionTimeout)??;
        stream.set_nodelay(self.core.config.nodelay)?;
        Ok(stream)
    }
}

impl TransportClient for TcpClient {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Tcp
    }

    async fn connect(&mut self, endpoint: &str) -> Result<()> {
        self.disconnect().await;

        let stream = self
            .establish(endpoint)
            .await
            .map_err(|e| self.core.connect_failed(endpoint, e))?;
        let source = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| endpoint.to_string());
        let (reader, writer) = stream.into_split();

        let link = self.core.open(endpoint);
        let reader = tokio::spawn(read_loop(link, reader, source));
        self.core.attach(reader);
        self.writer = Some(writer);
        Ok(())
    }

    async fn disconnect(&mut self) {
        // 丢弃写半部即关闭写方向
        self.writer = None;
        self.core.close().await;
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        self.core.require_connected()?;
        let Some(writer) = self.writer.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };

        let bytes = codec::frame_line(message);
        let result = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.core.stats.record_sent();
                debug!("Sent {} bytes over TCP", bytes.len());
                Ok(())
            }
            Err(e) => {
                self.core.emitter.error(format!("Failed to send: {e}"));
                self.disconnect().await;
                Err(e.into())
            }
        }
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

async fn read_loop(link: Link, mut reader: OwnedReadHalf, source: String) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => link.deliver(&buf[..n], &source),
            Err(e) => {
                link.emitter.error(format!("Receive error: {e}"));
                break;
            }
        }
    }
    link.closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{event_channel, EventReceiver};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    async fn next_event(rx: &mut EventReceiver) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_send_appends_newline_and_receives_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = event_channel();
        let mut client = TcpClient::new(ClientConfig::default(), tx);

        client.connect(&addr.to_string()).await.unwrap();
        assert!(client.is_connected());
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Connected {
                protocol: ProtocolKind::Tcp
            }
        ));

        let (server_side, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = server_side.into_split();
        client
            .send(&Message::structured(json!({"type": "hello"})))
            .await
            .unwrap();
        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"type\":\"hello\"}\n");

        write_half.write_all(b"{\"reply\":true}\n").await.unwrap();
        match next_event(&mut rx).await {
            TransportEvent::Message {
                message, source, ..
            } => {
                assert_eq!(message.as_json().unwrap()["reply"], true);
                assert_eq!(source, addr.to_string());
            }
            other => panic!("Unexpected event: {other:?}"),
        }
        assert_eq!(client.stats().sent(), 1);
        assert_eq!(client.stats().received(), 1);

        client.disconnect().await;
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Disconnected { .. }
        ));
        client.disconnect().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_close_emits_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = event_channel();
        let mut client = TcpClient::new(ClientConfig::default(), tx);

        client.connect(&addr.to_string()).await.unwrap();
        next_event(&mut rx).await;
        let (server_side, _) = listener.accept().await.unwrap();
        drop(server_side);

        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Disconnected { .. }
        ));
        assert!(!client.is_connected());
        assert!(matches!(
            client.send(&Message::plain_text("late")).await,
            Err(ProtocolError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = event_channel();
        let mut client = TcpClient::new(ClientConfig::default(), tx);
        assert!(client.connect(&addr.to_string()).await.is_err());
        assert!(!client.is_connected());
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_endpoint() {
        let (tx, _rx) = event_channel();
        let mut client = TcpClient::new(ClientConfig::default(), tx);
        assert!(matches!(
            client.connect("no-port").await,
            Err(ProtocolError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let (tx, _rx) = event_channel();
        let mut client = TcpClient::new(ClientConfig::default(), tx);
        assert!(matches!(
            client.send(&Message::plain_text("x")).await,
            Err(ProtocolError::NotConnected)
        ));
    }
}
