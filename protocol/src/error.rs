//! 错误类型定义

use thiserror::Error;

/// 协议错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 解析错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,

    /// 尚未连接
    #[error("Not connected")]
    NotConnected,

    /// 服务端未在监听
    #[error("Server is not listening")]
    NotListening,

    /// 地址格式错误
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// 只写出了部分数据
    #[error("Partial write: {written}/{expected} bytes")]
    PartialWrite { written: usize, expected: usize },

    /// 连接数已满
    #[error("Maximum clients reached ({max})")]
    CapacityExceeded { max: usize },

    /// 同一身份重复注册
    #[error("Peer already registered: {0}")]
    DuplicatePeer(String),

    /// 找不到对端
    #[error("Unknown peer: {0}")]
    PeerNotFound(String),

    /// 对端写队列已满
    #[error("Send queue full for {0}")]
    QueueFull(String),

    /// 广播时没有任何对端
    #[error("no peers to broadcast to")]
    NoPeers,

    /// HTTP 请求格式错误
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// 请求头过长
    #[error("Header block too large: {size} bytes (max: {max})")]
    HeaderTooLarge { size: usize, max: usize },

    /// 请求体过长
    #[error("Body too large: {size} bytes (max: {max})")]
    BodyTooLarge { size: usize, max: usize },

    /// 用户输入不符合格式
    #[error("Invalid {kind} input: {reason}")]
    InvalidInput { kind: &'static str, reason: String },

    /// WebSocket 错误
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// HTTP 请求发送失败
    #[error("Request failed: {0}")]
    Request(String),

    /// HTTP 非 2xx 状态码
    #[error("HTTP status {status} {reason}")]
    HttpStatus { status: u16, reason: String },
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, ProtocolError>;
