//! 四种传输的客户端实现
//!
//! 所有客户端实现 `protocol::TransportClient`，收到的消息和连接状态变化
//! 通过共享事件通道报告。HTTP 客户端额外支持长轮询。

mod state;

pub mod http;
pub mod tcp;
pub mod udp;
pub mod ws;

pub use http::{HttpClient, HttpMethod};
pub use tcp::TcpClient;
pub use udp::UdpClient;
pub use ws::WsClient;
