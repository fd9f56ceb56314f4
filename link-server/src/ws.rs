//! WebSocket 服务端
//!
//! 每个 WebSocket 帧是一条消息，不追加换行符。文本帧按当前格式解码，
//! 二进制帧解码为 RawBytes；发送时 RawBytes 走二进制帧，其余走文本帧。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use protocol::{
    codec, ConnectionRegistry, ConnectionStats, Emitter, Message, PayloadKind, PeerIdentity,
    ProtocolError, ProtocolKind, Result, ServerConfig, TransportEvent, TransportServer,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::control::{Command, ServerCore};
use crate::writer::PeerWriter;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// WebSocket 服务端
pub struct WsServer {
    core: ServerCore,
}

impl WsServer {
    pub fn new(config: ServerConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            core: ServerCore::new(ProtocolKind::WebSocket, config, events),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }
}

impl TransportServer for WsServer {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::WebSocket
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
            pending: HashMap::new(),
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

enum Input {
    /// 握手完成
    Joined { peer: PeerIdentity, sink: WsSink },
    HandshakeFailed { peer: PeerIdentity, error: String },
    Text { peer: PeerIdentity, data: Vec<u8> },
    Binary { peer: PeerIdentity, data: Vec<u8> },
    Closed { peer: PeerIdentity, error: Option<String> },
    WriteFailed { peer: PeerIdentity, error: String },
}

/// 写队列关闭时写任务发出 Close 帧
struct Peer {
    writer: PeerWriter<WsMessage>,
    reader: JoinHandle<()>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct Dispatch {
    listener: TcpListener,
    registry: ConnectionRegistry<Peer>,
    /// 握手尚未完成的连接
    pending: HashMap<PeerIdentity, JoinHandle<()>>,
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
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.on_accept(stream, addr),
                        Err(e) => self.emitter.error(format!("Failed to accept connection: {e}")),
                    }
                }

                Some(input) = self.input.recv() => self.on_input(input),

                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.on_command(command),
                    }
                }

                _ = sweep.tick() => self.sweep(),
            }
        }

        for (_, task) in self.pending.drain() {
            task.abort();
        }
        for (peer, handle) in self.registry.drain() {
            drop(handle);
            self.emitter.peer_disconnected(&peer);
        }
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let peer = PeerIdentity::from(addr);
        // 握手中的连接同样占用名额
        let max = self.registry.max_clients();
        if self.registry.len() + self.pending.len() >= max {
            drop(stream);
            self.emitter.error(format!(
                "Rejected {peer}: {}",
                ProtocolError::CapacityExceeded { max }
            ));
            return;
        }

        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
            debug!("Failed to set nodelay for {}: {}", peer, e);
        }
        let task = tokio::spawn(handshake(
            peer.clone(),
            stream,
            self.config.handshake_timeout,
            self.input_tx.clone(),
        ));
        self.pending.insert(peer, task);
    }

    fn on_input(&mut self, input: Input) {
        match input {
            Input::Joined { peer, sink } => {
                let Some(reader) = self.pending.remove(&peer) else {
                    return;
                };
                let input = self.input_tx.clone();
                let writer = PeerWriter::spawn(
                    peer.clone(),
                    sink,
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
                        info!("New WebSocket connection from {}", peer);
                        self.emitter.peer_connected(&peer);
                    }
                    Err((e, handle)) => {
                        drop(handle);
                        self.emitter.error(format!("Rejected {peer}: {e}"));
                    }
                }
            }
            Input::HandshakeFailed { peer, error } => {
                if self.pending.remove(&peer).is_some() {
                    self.emitter
                        .error(format!("WebSocket handshake with {peer} failed: {error}"));
                }
            }
            Input::Text { peer, data } => {
                if !self.registry.touch(&peer, Instant::now()) {
                    return;
                }
                let format = *self.format.borrow();
                if let Some(message) = codec::decode_line(&data, format, self.config.auto_detect) {
                    self.stats.record_received();
                    self.emitter.message(message, peer.to_string());
                }
            }
            Input::Binary { peer, data } => {
                if !self.registry.touch(&peer, Instant::now()) {
                    return;
                }
                self.stats.record_received();
                self.emitter
                    .message(codec::deserialize(&data, PayloadKind::RawBytes), peer.to_string());
            }
            Input::Closed { peer, error } => {
                if self.registry.remove(&peer).is_some() {
                    match error {
                        Some(e) => warn!("WebSocket connection {} closed with error: {}", peer, e),
                        None => info!("WebSocket connection {} closed", peer),
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

        let frame = codec::to_frame(message);
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (peer, handle) in self.registry.iter_mut() {
            match handle.writer.push(frame.clone().into_message::<WsMessage>()) {
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
        debug!("Broadcast to {} WebSocket peers", delivered);
        Ok(delivered)
    }

    fn send_to(&mut self, peer: &PeerIdentity, message: &Message) -> Result<()> {
        let handle = self.registry.require_mut(peer)?;
        match handle.writer.push(codec::to_frame(message).into_message::<WsMessage>()) {
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

    fn drop_peer(&mut self, peer: &PeerIdentity, description: String) {
        if self.registry.remove(peer).is_some() {
            self.emitter.error(description);
            self.emitter.peer_disconnected(peer);
        }
    }

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

/// 完成握手后转为读取任务，握手超时同样视为失败
async fn handshake(
    peer: PeerIdentity,
    stream: TcpStream,
    deadline: Duration,
    input: mpsc::UnboundedSender<Input>,
) {
    let error = match timeout(deadline, tokio_tungstenite::accept_async(stream)).await {
        Ok(Ok(ws)) => {
            let (sink, stream) = ws.split();
            if input
                .send(Input::Joined {
                    peer: peer.clone(),
                    sink,
                })
                .is_err()
            {
                return;
            }
            read_loop(peer, stream, input).await;
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {}ms", deadline.as_millis()),
    };
    let _ = input.send(Input::HandshakeFailed { peer, error });
}

async fn read_loop(
    peer: PeerIdentity,
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    input: mpsc::UnboundedSender<Input>,
) {
    let error = loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        };
        let forwarded = match frame {
            WsMessage::Text(text) => input.send(Input::Text {
                peer: peer.clone(),
                data: text.as_bytes().to_vec(),
            }),
            WsMessage::Binary(data) => input.send(Input::Binary {
                peer: peer.clone(),
                data: data.to_vec(),
            }),
            WsMessage::Close(_) => break None,
            // Ping/Pong 由协议栈自动处理
            _ => Ok(()),
        };
        if forwarded.is_err() {
            return;
        }
    };
    let _ = input.send(Input::Closed { peer, error });
}
