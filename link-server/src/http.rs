//! HTTP/1.1 服务端
//!
//! 每个连接维护一个 `RequestBuffer`，读到的字节累积到出现完整请求为止。
//! 请求体按 Content-Type 协商的格式解码成消息，响应格式由 Accept 决定。
//!
//! HTTP 只能在请求到来时回复，因此 `send_to_peer`/`send_to_all` 把消息放进
//! 对端的待发队列，下一个 GET 请求取走一条作为响应体；队列为空时回复确认信息。

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{
    codec, negotiate, ConnectionRegistry, ConnectionStats, Emitter, HttpRequest, Message,
    PayloadKind, PeerIdentity, ProtocolError, ProtocolKind, RequestBuffer, Result, ServerConfig,
    TransportEvent, TransportServer, READ_BUFFER_SIZE, SERVER_NAME,
};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::control::{Command, ServerCore};
use crate::writer::PeerWriter;

/// 每个对端待发队列的上限，超出时丢弃最旧的消息
const OUTBOX_CAPACITY: usize = 256;

const ALLOWED_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, HEAD, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type, Accept";

/// HTTP 服务端
pub struct HttpServer {
    core: ServerCore,
}

impl HttpServer {
    pub fn new(config: ServerConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            core: ServerCore::new(ProtocolKind::Http, config, events),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }
}

impl TransportServer for HttpServer {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Http
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

/// 待写出的 HTTP 响应
#[derive(Debug)]
struct Response {
    status: u16,
    reason: &'static str,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
    /// HEAD 请求只写头部
    head_only: bool,
}

impl Response {
    fn new(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
            head_only: false,
        }
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers.push(("Content-Type", content_type.to_string()));
        self.body = body;
        self
    }

    /// CORS 预检响应
    fn preflight() -> Self {
        Self::new(204, "No Content")
            .header("Allow", ALLOWED_METHODS)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", ALLOWED_METHODS)
            .header("Access-Control-Allow-Headers", ALLOWED_HEADERS)
    }

    /// 请求解析失败时的响应，发送后关闭连接
    fn rejection(error: &ProtocolError) -> Self {
        let (status, reason) = match error {
            ProtocolError::HeaderTooLarge { .. } | ProtocolError::BodyTooLarge { .. } => {
                (413, "Payload Too Large")
            }
            _ => (400, "Bad Request"),
        };
        Self::new(status, reason)
            .header("Access-Control-Allow-Origin", "*")
            .body(
                PayloadKind::PlainText.mime_type(),
                error.to_string().into_bytes(),
            )
    }

    fn to_bytes(&self, keep_alive: bool) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        if self.status != 204 {
            let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        }
        let connection = if keep_alive { "keep-alive" } else { "close" };
        let _ = write!(head, "Connection: {connection}\r\nServer: {SERVER_NAME}\r\n\r\n");

        let mut bytes = head.into_bytes();
        if !self.head_only && self.status != 204 {
            bytes.extend_from_slice(&self.body);
        }
        bytes
    }
}

/// 确认信息，按协商的格式渲染
fn acknowledgement(kind: PayloadKind, method: &str, path: &str) -> Message {
    let text = format!("received {method} {path}");
    match kind {
        PayloadKind::Structured => Message::structured(json!({
            "status": "received",
            "method": method,
            "path": path,
        })),
        PayloadKind::Markup => Message::markup(format!(
            "<response><status>received</status><method>{}</method><path>{}</path></response>",
            escape_xml(method),
            escape_xml(path)
        )),
        PayloadKind::Tabular => Message::tabular(format!(
            "status,method,path\nreceived,{},{}",
            csv_field(method),
            csv_field(path)
        )),
        PayloadKind::PlainText => Message::plain_text(text),
        PayloadKind::RawBytes => Message::raw_bytes(text.into_bytes()),
        PayloadKind::HexText => Message::hex_text(text.into_bytes()),
    }
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// 处理完一批请求后连接的去向
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    KeepAlive,
    Close,
}

#[derive(Debug)]
enum Input {
    Data { peer: PeerIdentity, data: Vec<u8> },
    Closed { peer: PeerIdentity, error: Option<String> },
    WriteFailed { peer: PeerIdentity, error: String },
}

struct Peer {
    writer: PeerWriter<Vec<u8>>,
    reader: JoinHandle<()>,
    buffer: RequestBuffer,
    outbox: VecDeque<Message>,
}

impl Peer {
    fn enqueue(&mut self, peer: &PeerIdentity, message: Message) {
        if self.outbox.len() >= OUTBOX_CAPACITY {
            self.outbox.pop_front();
            debug!("Outbox for {} full, dropped oldest message", peer);
        }
        self.outbox.push_back(message);
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// 处理请求时需要的只读上下文
struct Context<'a> {
    peer: &'a PeerIdentity,
    format: PayloadKind,
    auto_detect: bool,
    emitter: &'a Emitter,
    stats: &'a ConnectionStats,
}

impl Context<'_> {
    /// 处理缓冲区内所有完整请求，响应放入写队列
    fn serve(&self, handle: &mut Peer, data: &[u8]) -> Result<Disposition> {
        handle.buffer.extend(data);
        loop {
            let request = match handle.buffer.next_request() {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(Disposition::KeepAlive),
                Err(e) => {
                    self.emitter
                        .error(format!("Bad request from {}: {e}", self.peer));
                    let response = Response::rejection(&e);
                    handle.writer.push(response.to_bytes(false))?;
                    return Ok(Disposition::Close);
                }
            };

            let keep_alive = !request
                .header("Connection")
                .is_some_and(|value| value.eq_ignore_ascii_case("close"));
            let response = self.respond(handle, &request);
            handle.writer.push(response.to_bytes(keep_alive))?;
            if !keep_alive {
                return Ok(Disposition::Close);
            }
        }
    }

    fn respond(&self, handle: &mut Peer, request: &HttpRequest) -> Response {
        debug!("{} {} from {}", request.method, request.path, self.peer);
        if request.is_preflight() {
            return Response::preflight();
        }

        if !request.body.is_empty() {
            let kind = match request.header("Content-Type") {
                Some(content_type) => negotiate(Some(content_type), self.format),
                None if self.auto_detect => codec::detect_kind(&request.body),
                None => self.format,
            };
            let message = codec::deserialize(&request.body, kind);
            self.stats.record_received();
            self.emitter.message(
                message,
                format!("{} [{} {}]", self.peer, request.method, request.path),
            );
        }

        let queued = if request.method.eq_ignore_ascii_case("GET") {
            handle.outbox.pop_front()
        } else {
            None
        };
        let message = match queued {
            Some(message) => {
                self.stats.record_sent();
                message
            }
            None => {
                let kind = negotiate(request.header("Accept"), self.format);
                acknowledgement(kind, &request.method, &request.path)
            }
        };

        let mut response = Response::new(200, "OK")
            .header("Access-Control-Allow-Origin", "*")
            .body(message.kind().mime_type(), codec::serialize(&message));
        response.head_only = request.method.eq_ignore_ascii_case("HEAD");
        response
    }
}

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
        let handle = Peer {
            writer,
            reader,
            buffer: RequestBuffer::new(),
            outbox: VecDeque::new(),
        };

        match self.registry.register(peer.clone(), handle, Instant::now()) {
            Ok(()) => {
                info!("New HTTP connection from {}", peer);
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
                if !self.registry.touch(&peer, Instant::now()) {
                    return;
                }
                let context = Context {
                    peer: &peer,
                    format: *self.format.borrow(),
                    auto_detect: self.config.auto_detect,
                    emitter: &self.emitter,
                    stats: &self.stats,
                };
                let Some(handle) = self.registry.get_mut(&peer) else {
                    return;
                };
                match context.serve(handle, &data) {
                    Ok(Disposition::KeepAlive) => {}
                    Ok(Disposition::Close) => {
                        if self.registry.remove(&peer).is_some() {
                            info!("HTTP connection {} closed", peer);
                            self.emitter.peer_disconnected(&peer);
                        }
                    }
                    Err(e) => self.drop_peer(&peer, format!("Failed to respond to {peer}: {e}")),
                }
            }
            Input::Closed { peer, error } => {
                if self.registry.remove(&peer).is_some() {
                    match error {
                        Some(e) => warn!("HTTP connection {} closed with error: {}", peer, e),
                        None => debug!("HTTP connection {} closed by client", peer),
                    }
                    self.emitter.peer_disconnected(&peer);
                }
            }
            Input::WriteFailed { peer, error } => {
                self.drop_peer(&peer, format!("Failed to respond to {peer}: {error}"));
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SendToAll { message, reply } => {
                let _ = reply.send(self.broadcast(message));
            }
            Command::SendToPeer {
                peer,
                message,
                reply,
            } => {
                let result = self
                    .registry
                    .require_mut(&peer)
                    .map(|handle| handle.enqueue(&peer, message));
                let _ = reply.send(result);
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.registry.identities());
            }
            Command::Shutdown => {}
        }
    }

    fn broadcast(&mut self, message: Message) -> Result<usize> {
        if self.registry.is_empty() {
            self.emitter.error(ProtocolError::NoPeers);
            return Err(ProtocolError::NoPeers);
        }
        let mut queued = 0;
        for (peer, handle) in self.registry.iter_mut() {
            handle.enqueue(peer, message.clone());
            queued += 1;
        }
        debug!("Queued broadcast for {} HTTP peers", queued);
        Ok(queued)
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
