//! 多协议消息层共享库
//!
//! 包含:
//! - 消息信封与负载编解码 (Message, codec)
//! - 格式协商 (negotiate)
//! - HTTP 请求重组 (RequestBuffer)
//! - 连接注册表 (ConnectionRegistry)
//! - 传输层事件与抽象 (TransportEvent, TransportClient, TransportServer)

mod constants;
mod error;
mod event;
mod framer;
mod message;
mod negotiate;
mod registry;
mod stats;
mod transport;

pub mod codec;

pub use constants::*;
pub use error::{ProtocolError, Result};
pub use event::{event_channel, Emitter, EventReceiver, ProtocolKind, TransportEvent};
pub use framer::{HttpRequest, RequestBuffer};
pub use message::{Message, Payload, PayloadKind};
pub use negotiate::negotiate;
pub use registry::{ConnectionRegistry, PeerIdentity};
pub use stats::ConnectionStats;
pub use transport::{parse_endpoint, ClientConfig, ServerConfig, TransportClient, TransportServer};
