//! 四种传输的服务端实现
//!
//! 每个服务端持有一个调度任务，负责接受连接、转发入站消息、
//! 执行发送命令和空闲清理，所有结果通过事件通道报告。

mod control;
mod writer;

pub mod http;
pub mod tcp;
pub mod udp;
pub mod ws;

pub use http::HttpServer;
pub use tcp::TcpServer;
pub use udp::UdpServer;
pub use ws::WsServer;
