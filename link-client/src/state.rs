//! 客户端公共状态
//!
//! `ClientCore` 由客户端句柄持有；`Link` 是交给读取任务的那一半，
//! 两者共享连接标志，谁先把标志从 true 改为 false 谁负责发出 `Disconnected`。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use protocol::{
    codec, ClientConfig, ConnectionStats, Emitter, Message, PayloadKind, ProtocolError,
    ProtocolKind, Result, TransportEvent,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub(crate) struct ClientCore {
    pub(crate) config: ClientConfig,
    pub(crate) emitter: Emitter,
    pub(crate) stats: Arc<ConnectionStats>,
    format: watch::Sender<PayloadKind>,
    connected: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl ClientCore {
    pub(crate) fn new(
        protocol: ProtocolKind,
        config: ClientConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (format, _) = watch::channel(config.format);
        Self {
            config,
            emitter: Emitter::new(protocol, events),
            stats: Arc::new(ConnectionStats::new()),
            format,
            connected: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    pub(crate) fn protocol(&self) -> ProtocolKind {
        self.emitter.protocol()
    }

    pub(crate) fn format_rx(&self) -> watch::Receiver<PayloadKind> {
        self.format.subscribe()
    }

    pub(crate) fn set_format(&self, kind: PayloadKind) {
        self.format.send_replace(kind);
        debug!("{} client format set to {}", self.protocol(), kind);
    }

    pub(crate) fn format(&self) -> PayloadKind {
        *self.format.borrow()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// 未连接时报告并返回 `NotConnected`
    pub(crate) fn require_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            self.emitter.error(ProtocolError::NotConnected);
            Err(ProtocolError::NotConnected)
        }
    }

    /// 报告连接失败
    pub(crate) fn connect_failed(&self, endpoint: &str, error: ProtocolError) -> ProtocolError {
        self.emitter
            .error(format!("Failed to connect to {endpoint}: {error}"));
        error
    }

    /// 标记为已连接并发出 `Connected`，返回交给读取任务的 `Link`
    ///
    /// 必须在启动读取任务之前调用，保证 `Connected` 先于任何消息事件。
    pub(crate) fn open(&mut self, endpoint: &str) -> Link {
        self.connected.store(true, Ordering::SeqCst);
        self.stats.connection_started();
        info!("{} client connected to {}", self.protocol(), endpoint);
        self.emitter.connected();
        Link {
            emitter: self.emitter.clone(),
            stats: Arc::clone(&self.stats),
            format: self.format_rx(),
            connected: Arc::clone(&self.connected),
        }
    }

    /// 记录读取任务
    pub(crate) fn attach(&mut self, reader: JoinHandle<()>) {
        self.reader = Some(reader);
    }

    /// 停止读取任务；此前处于连接状态时发出 `Disconnected`
    pub(crate) async fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            self.stats.connection_stopped();
            info!("{} client disconnected", self.protocol());
            self.emitter.disconnected();
        }
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// 读取任务持有的连接上下文
pub(crate) struct Link {
    pub(crate) emitter: Emitter,
    stats: Arc<ConnectionStats>,
    format: watch::Receiver<PayloadKind>,
    connected: Arc<AtomicBool>,
}

impl Link {
    /// 按当前格式解码一次读取并发出消息
    pub(crate) fn deliver(&self, data: &[u8], source: &str) {
        let format = *self.format.borrow();
        if let Some(message) = codec::decode_line(data, format, false) {
            self.deliver_message(message, source);
        }
    }

    pub(crate) fn deliver_message(&self, message: Message, source: &str) {
        self.stats.record_received();
        self.emitter.message(message, source);
    }

    /// 对端关闭连接
    pub(crate) fn closed(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.stats.connection_stopped();
            info!("{} connection closed by peer", self.emitter.protocol());
            self.emitter.disconnected();
        }
    }
}
