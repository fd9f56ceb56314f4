//! WebSocket 客户端

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{
    codec, ClientConfig, ConnectionStats, Message, PayloadKind, ProtocolError, ProtocolKind,
    Result, TransportClient, TransportEvent,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::state::{ClientCore, Link};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket 客户端
///
/// RawBytes 消息用二进制帧发送，其余格式用文本帧。
pub struct WsClient {
    core: ClientCore,
    sink: Option<SplitSink<WsStream, WsMessage>>,
}

impl WsClient {
    pub fn new(config: ClientConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            core: ClientCore::new(ProtocolKind::WebSocket, config, events),
            sink: None,
        }
    }

    async fn handshake(&self, url: &str) -> Result<WsStream> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ProtocolError::InvalidEndpoint(url.to_string()));
        }
        let (stream, response) = timeout(self.core.config.connect_timeout, connect_async(url))
            .await
            .map_err(|_| ProtocolError::ConnectionTimeout)?
            .map_err(|e| ProtocolError::WebSocket(e.to_string()))?;
        debug!("WebSocket handshake with {} answered {}", url, response.status());
        Ok(stream)
    }
}

impl TransportClient for WsClient {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::WebSocket
    }

    async fn connect(&mut self, endpoint: &str) -> Result<()> {
        self.disconnect().await;

        let stream = self
            .handshake(endpoint)
            .await
            .map_err(|e| self.core.connect_failed(endpoint, e))?;
        let (sink, stream) = stream.split();

        let link = self.core.open(endpoint);
        let reader = tokio::spawn(read_loop(link, stream, endpoint.to_string()));
        self.core.attach(reader);
        self.sink = Some(sink);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            let _ = timeout(CLOSE_TIMEOUT, sink.close()).await;
        }
        self.core.close().await;
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        self.core.require_connected()?;
        let Some(sink) = self.sink.as_mut() else {
            return Err(ProtocolError::NotConnected);
        };

        match sink.send(codec::to_frame(message).into_message::<WsMessage>()).await {
            Ok(()) => {
                self.core.stats.record_sent();
                Ok(())
            }
            Err(e) => {
                let error = ProtocolError::WebSocket(e.to_string());
                self.core.emitter.error(format!("Failed to send: {error}"));
                self.sink = None;
                self.core.close().await;
                Err(error)
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

async fn read_loop(link: Link, mut stream: SplitStream<WsStream>, source: String) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => link.deliver(text.as_bytes(), &source),
            Ok(WsMessage::Binary(data)) => {
                link.deliver_message(codec::deserialize(&data, PayloadKind::RawBytes), &source)
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                link.emitter.error(format!("Receive error: {e}"));
                break;
            }
        }
    }
    link.closed();
}
