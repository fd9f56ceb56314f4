//! 传输层事件
//!
//! 所有传输实现通过同一个通道向上层报告事件，每个事件都带有产生它的协议标签。

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::message::Message;
use crate::registry::PeerIdentity;

/// 协议标签
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Tcp,
    Udp,
    WebSocket,
    Http,
}

impl ProtocolKind {
    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::Tcp => "TCP",
            ProtocolKind::Udp => "UDP",
            ProtocolKind::WebSocket => "WebSocket",
            ProtocolKind::Http => "HTTP",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 传输层发给上层的事件
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// 收到消息
    Message {
        protocol: ProtocolKind,
        message: Message,
        source: String,
        timestamp: DateTime<Local>,
    },
    /// 客户端已连接
    Connected { protocol: ProtocolKind },
    /// 客户端已断开
    Disconnected { protocol: ProtocolKind },
    /// 服务端接入新对端
    PeerConnected {
        protocol: ProtocolKind,
        peer: PeerIdentity,
    },
    /// 服务端对端离开
    PeerDisconnected {
        protocol: ProtocolKind,
        peer: PeerIdentity,
    },
    /// 错误描述
    Error {
        protocol: ProtocolKind,
        description: String,
    },
    /// 长轮询已自动停止
    PollingStopped {
        protocol: ProtocolKind,
        reason: String,
    },
}

impl TransportEvent {
    pub fn protocol(&self) -> ProtocolKind {
        match self {
            TransportEvent::Message { protocol, .. }
            | TransportEvent::Connected { protocol }
            | TransportEvent::Disconnected { protocol }
            | TransportEvent::PeerConnected { protocol, .. }
            | TransportEvent::PeerDisconnected { protocol, .. }
            | TransportEvent::Error { protocol, .. }
            | TransportEvent::PollingStopped { protocol, .. } => *protocol,
        }
    }
}

/// 事件接收端
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// 创建事件通道
pub fn event_channel() -> (mpsc::UnboundedSender<TransportEvent>, EventReceiver) {
    mpsc::unbounded_channel()
}

/// 事件发射器
///
/// 固定携带一个协议标签，接收端已关闭时事件被静默丢弃。
#[derive(Debug, Clone)]
pub struct Emitter {
    protocol: ProtocolKind,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl Emitter {
    pub fn new(protocol: ProtocolKind, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { protocol, tx }
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(event);
    }

    pub fn message(&self, message: Message, source: impl Into<String>) {
        self.emit(TransportEvent::Message {
            protocol: self.protocol,
            message,
            source: source.into(),
            timestamp: Local::now(),
        });
    }

    pub fn connected(&self) {
        self.emit(TransportEvent::Connected {
            protocol: self.protocol,
        });
    }

    pub fn disconnected(&self) {
        self.emit(TransportEvent::Disconnected {
            protocol: self.protocol,
        });
    }

    pub fn peer_connected(&self, peer: &PeerIdentity) {
        self.emit(TransportEvent::PeerConnected {
            protocol: self.protocol,
            peer: peer.clone(),
        });
    }

    pub fn peer_disconnected(&self, peer: &PeerIdentity) {
        self.emit(TransportEvent::PeerDisconnected {
            protocol: self.protocol,
            peer: peer.clone(),
        });
    }

    pub fn error(&self, description: impl fmt::Display) {
        let description = description.to_string();
        tracing::warn!("{} error: {}", self.protocol, description);
        self.emit(TransportEvent::Error {
            protocol: self.protocol,
            description,
        });
    }

    pub fn polling_stopped(&self, reason: impl Into<String>) {
        self.emit(TransportEvent::PollingStopped {
            protocol: self.protocol,
            reason: reason.into(),
        });
    }
}
