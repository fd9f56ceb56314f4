//! 传输层抽象
//!
//! 四种传输（TCP、UDP、WebSocket、HTTP）的客户端和服务端分别实现
//! `TransportClient` 与 `TransportServer`，上层只依赖这两个 trait 和事件通道。

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ProtocolError, Result};
use crate::event::ProtocolKind;
use crate::message::{Message, PayloadKind};
use crate::registry::PeerIdentity;
use crate::stats::ConnectionStats;
use crate::{
    CONNECT_TIMEOUT, IDLE_TIMEOUT, MAX_CLIENTS, MAX_POLL_ERRORS, POLL_INTERVAL, REQUEST_TIMEOUT,
    SWEEP_INTERVAL, WRITE_TIMEOUT,
};

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 连接超时时间
    pub connect_timeout: Duration,
    /// 是否禁用 Nagle 算法（TCP nodelay）
    pub nodelay: bool,
    /// 初始负载格式
    pub format: PayloadKind,
    /// HTTP 单次请求超时
    pub request_timeout: Duration,
    /// HTTP 轮询间隔
    pub poll_interval: Duration,
    /// 连续轮询失败上限
    pub max_poll_errors: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            nodelay: true,
            format: PayloadKind::Structured,
            request_timeout: REQUEST_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            max_poll_errors: MAX_POLL_ERRORS,
        }
    }
}

/// 服务端配置
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// 监听地址
    pub bind_host: String,
    /// 最大连接数
    pub max_clients: usize,
    /// 空闲超时
    pub idle_timeout: Duration,
    /// 空闲扫描间隔
    pub sweep_interval: Duration,
    /// 初始负载格式
    pub format: PayloadKind,
    /// 是否按内容自动识别入站格式
    pub auto_detect: bool,
    /// 是否禁用 Nagle 算法（TCP nodelay）
    pub nodelay: bool,
    /// WebSocket 握手必须在此时间内完成
    pub handshake_timeout: Duration,
    /// 写出一条数据的最长等待时间
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            max_clients: MAX_CLIENTS,
            idle_timeout: IDLE_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
            format: PayloadKind::Structured,
            auto_detect: false,
            nodelay: true,
            handshake_timeout: CONNECT_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// 监听地址字符串
    pub fn bind_addr(&self, port: u16) -> String {
        format!("{}:{}", self.bind_host, port)
    }
}

/// 客户端统一接口
pub trait TransportClient: Send {
    /// 协议标签
    fn protocol(&self) -> ProtocolKind;

    /// 建立连接
    ///
    /// # Arguments
    /// * `endpoint` - TCP/UDP 为 "host:port"，WebSocket/HTTP 为 URL
    fn connect(&mut self, endpoint: &str) -> impl Future<Output = Result<()>> + Send;

    /// 断开连接，可重复调用
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

    /// 发送消息
    fn send(&mut self, message: &Message) -> impl Future<Output = Result<()>> + Send;

    fn is_connected(&self) -> bool;

    /// 切换负载格式
    fn set_format(&self, kind: PayloadKind);

    fn format(&self) -> PayloadKind;

    fn stats(&self) -> Arc<ConnectionStats>;
}

/// 服务端统一接口
pub trait TransportServer: Send {
    /// 协议标签
    fn protocol(&self) -> ProtocolKind;

    /// 开始监听，返回实际绑定的地址
    fn start(&mut self, port: u16) -> impl Future<Output = Result<SocketAddr>> + Send;

    /// 停止监听并断开所有对端，可重复调用
    fn stop(&mut self) -> impl Future<Output = ()> + Send;

    fn is_listening(&self) -> bool;

    /// 广播消息，返回送达的对端数
    fn send_to_all(&self, message: &Message) -> impl Future<Output = Result<usize>> + Send;

    /// 发送给指定对端
    fn send_to_peer(
        &self,
        peer: &PeerIdentity,
        message: &Message,
    ) -> impl Future<Output = Result<()>> + Send;

    /// 当前对端列表
    fn peers(&self) -> impl Future<Output = Result<Vec<PeerIdentity>>> + Send;

    /// 切换负载格式
    fn set_format(&self, kind: PayloadKind);

    fn format(&self) -> PayloadKind;

    fn stats(&self) -> Arc<ConnectionStats>;
}

/// 校验 "host:port" 格式的地址
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let (host, port) = endpoint
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| ProtocolError::InvalidEndpoint(endpoint.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port: u16 = port
        .parse()
        .map_err(|_| ProtocolError::InvalidEndpoint(endpoint.to_string()))?;
    if host.is_empty() || port == 0 {
        return Err(ProtocolError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok((host.to_string(), port))
}
