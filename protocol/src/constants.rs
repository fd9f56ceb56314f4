//! 协议常量定义

use std::time::Duration;

/// 服务端标识，写入 HTTP 响应的 Server 头
pub const SERVER_NAME: &str = "CommLink/1.0";

/// 服务端最大连接数
pub const MAX_CLIENTS: usize = 100;

/// 单次读取缓冲区大小
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// UDP 数据报最大长度
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// HTTP 请求头最大长度
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// HTTP 请求体最大长度
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 3;

/// 空闲超时（秒）- 超过此时间无数据则断开
pub const IDLE_TIMEOUT_SECS: u64 = 300;

/// 空闲扫描间隔（秒）
pub const SWEEP_INTERVAL_SECS: u64 = 60;

/// HTTP 轮询间隔（毫秒）
pub const POLL_INTERVAL_MS: u64 = 2000;

/// 连续轮询失败次数上限，达到后自动停止轮询
pub const MAX_POLL_ERRORS: u32 = 3;

/// HTTP 请求超时（秒）
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// 单次写出超时（秒）- 对端长时间不读取则视为写失败
pub const WRITE_TIMEOUT_SECS: u64 = 5;

/// 每个对端写队列的容量，队列满时断开该对端
pub const PEER_QUEUE_CAPACITY: usize = 64;

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);

/// 空闲超时 Duration
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(IDLE_TIMEOUT_SECS);

/// 空闲扫描间隔 Duration
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(SWEEP_INTERVAL_SECS);

/// 轮询间隔 Duration
pub const POLL_INTERVAL: Duration = Duration::from_millis(POLL_INTERVAL_MS);

/// 请求超时 Duration
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(REQUEST_TIMEOUT_SECS);

/// 写出超时 Duration
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(WRITE_TIMEOUT_SECS);
