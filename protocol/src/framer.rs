//! HTTP 请求重组
//!
//! 把任意切分的字节流还原为完整的请求:
//! ```text
//! ┌──────────────────────────────┬──────────┬────────────────────────┐
//! │ 请求行 + 头部                │ \r\n\r\n │ Body (Content-Length)  │
//! └──────────────────────────────┴──────────┴────────────────────────┘
//! ```
//! 消费掉的前缀从缓冲区移除，剩余的流水线请求留待下次解析。

use bytes::{Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::{MAX_BODY_SIZE, MAX_HEADER_SIZE};

const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";

/// 一个完整的 HTTP 请求
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    /// 按出现顺序保存的头部
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    /// 按名称查找头部（不区分大小写）
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// 是否为 CORS 预检请求
    pub fn is_preflight(&self) -> bool {
        self.method.eq_ignore_ascii_case("OPTIONS")
    }
}

/// 请求头解析结果，尚未确认 body 是否完整
struct RequestHead {
    method: String,
    path: String,
    version: String,
    headers: Vec<(String, String)>,
    content_length: usize,
}

/// 每个连接的请求缓冲区
#[derive(Debug)]
pub struct RequestBuffer {
    buffer: BytesMut,
    max_header: usize,
    max_body: usize,
}

impl Default for RequestBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuffer {
    pub fn new() -> Self {
        Self::with_limits(MAX_HEADER_SIZE, MAX_BODY_SIZE)
    }

    pub fn with_limits(max_header: usize, max_body: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_header,
            max_body,
        }
    }

    /// 追加新读到的字节
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// 已缓冲的字节数
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// 尝试取出一个完整请求
    ///
    /// 头部或 body 不完整时返回 `Ok(None)`，缓冲区保持不变。
    pub fn next_request(&mut self) -> Result<Option<HttpRequest>> {
        let Some(header_end) = find_delimiter(&self.buffer) else {
            if self.buffer.len() > self.max_header {
                return Err(ProtocolError::HeaderTooLarge {
                    size: self.buffer.len(),
                    max: self.max_header,
                });
            }
            return Ok(None);
        };
        if header_end > self.max_header {
            return Err(ProtocolError::HeaderTooLarge {
                size: header_end,
                max: self.max_header,
            });
        }

        let head = parse_head(&self.buffer[..header_end])?;
        if head.content_length > self.max_body {
            return Err(ProtocolError::BodyTooLarge {
                size: head.content_length,
                max: self.max_body,
            });
        }

        let body_start = header_end + HEADER_DELIMITER.len();
        if self.buffer.len() < body_start + head.content_length {
            return Ok(None);
        }

        let _ = self.buffer.split_to(body_start);
        let body = self.buffer.split_to(head.content_length).freeze();

        Ok(Some(HttpRequest {
            method: head.method,
            path: head.path,
            version: head.version,
            headers: head.headers,
            body,
        }))
    }

    /// 取出缓冲区中所有完整请求
    pub fn drain(&mut self) -> Result<Vec<HttpRequest>> {
        let mut requests = Vec::new();
        while let Some(request) = self.next_request()? {
            requests.push(request);
        }
        Ok(requests)
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_DELIMITER.len())
        .position(|window| window == HEADER_DELIMITER)
}

fn parse_head(block: &[u8]) -> Result<RequestHead> {
    let text = std::str::from_utf8(block)
        .map_err(|_| ProtocolError::MalformedRequest("header block is not UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) if method.bytes().all(|b| b.is_ascii_alphabetic()) => {
            (method.to_string(), path.to_string())
        }
        _ => {
            return Err(ProtocolError::MalformedRequest(format!(
                "bad request line '{request_line}'"
            )))
        }
    };
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = Vec::new();
    for line in lines.filter(|line| !line.is_empty()) {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::MalformedRequest(format!("bad header line '{line}'")))?;
        headers.push((key.trim().to_string(), value.trim().to_string()));
    }

    let content_length = match headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("Content-Length"))
    {
        Some((_, value)) => value.parse::<usize>().map_err(|_| {
            ProtocolError::MalformedRequest(format!("bad Content-Length '{value}'"))
        })?,
        None => 0,
    };

    Ok(RequestHead {
        method,
        path,
        version,
        headers,
        content_length,
    })
}
