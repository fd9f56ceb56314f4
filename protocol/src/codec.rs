//! 负载编解码
//!
//! 每种格式的线路表示:
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ Structured   │ 紧凑 JSON                     │
//! │ Markup       │ UTF-8 文本原样                │
//! │ Tabular      │ UTF-8 文本原样                │
//! │ PlainText    │ UTF-8 文本原样                │
//! │ RawBytes     │ 字节原样                      │
//! │ HexText      │ 小写十六进制文本              │
//! └──────────────┴──────────────────────────────┘
//! ```
//!
//! TCP/UDP 发送端在消息末尾追加换行符（RawBytes 除外），接收端允许没有换行符。

use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::message::{Message, Payload, PayloadKind};

/// 将消息编码为线路字节
///
/// 不会失败：无法表示的负载返回空字节序列。
pub fn serialize(message: &Message) -> Vec<u8> {
    match (message.kind(), message.payload()) {
        (PayloadKind::Structured, Payload::Structured(value)) => {
            serde_json::to_vec(value).unwrap_or_default()
        }
        (PayloadKind::HexText, Payload::Bytes(bytes)) => encode_hex(bytes).into_bytes(),
        (PayloadKind::RawBytes, Payload::Bytes(bytes)) => bytes.clone(),
        (kind, Payload::Text(text)) if kind.is_text() => text.as_bytes().to_vec(),
        _ => Vec::new(),
    }
}

/// 按指定格式解码线路字节
///
/// JSON 或十六进制解析失败时降级为纯文本消息，不返回错误。
pub fn deserialize(bytes: &[u8], kind: PayloadKind) -> Message {
    match kind {
        PayloadKind::Structured => match serde_json::from_slice::<Value>(bytes) {
            Ok(value) => Message::structured(value),
            Err(e) => {
                tracing::debug!("Structured payload did not parse, keeping as text: {}", e);
                Message::plain_text(String::from_utf8_lossy(bytes))
            }
        },
        PayloadKind::Markup | PayloadKind::Tabular | PayloadKind::PlainText => {
            Message::text_of(kind, String::from_utf8_lossy(bytes))
        }
        PayloadKind::RawBytes => Message::raw_bytes(bytes.to_vec()),
        PayloadKind::HexText => {
            let text = String::from_utf8_lossy(bytes);
            match decode_hex(&text) {
                Some(decoded) => Message::hex_text(decoded),
                None => Message::plain_text(text),
            }
        }
    }
}

/// 检查用户输入是否符合格式
pub fn validate_input(input: &str, kind: PayloadKind) -> bool {
    match kind {
        PayloadKind::Structured => serde_json::from_str::<Value>(input).is_ok(),
        PayloadKind::HexText => input
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c.is_whitespace()),
        PayloadKind::PlainText => true,
        PayloadKind::Markup | PayloadKind::Tabular | PayloadKind::RawBytes => !input.is_empty(),
    }
}

/// 将用户输入解析为消息
///
/// RawBytes 输入若为合法十六进制则按十六进制解码，否则取其 UTF-8 字节。
pub fn parse_input(input: &str, kind: PayloadKind) -> Result<Message> {
    match kind {
        PayloadKind::Structured => {
            let value: Value = serde_json::from_str(input)?;
            Ok(Message::structured(value))
        }
        PayloadKind::Markup | PayloadKind::Tabular | PayloadKind::PlainText => {
            Ok(Message::text_of(kind, input))
        }
        PayloadKind::HexText => decode_hex(input)
            .map(Message::hex_text)
            .ok_or_else(|| ProtocolError::InvalidInput {
                kind: kind.name(),
                reason: "only hex digits and whitespace are allowed".to_string(),
            }),
        PayloadKind::RawBytes => {
            let bytes = match decode_hex(input) {
                Some(decoded) if !decoded.is_empty() => decoded,
                _ => input.as_bytes().to_vec(),
            };
            Ok(Message::raw_bytes(bytes))
        }
    }
}

/// 根据内容猜测格式
pub fn detect_kind(bytes: &[u8]) -> PayloadKind {
    if serde_json::from_slice::<Value>(bytes).is_ok() {
        return PayloadKind::Structured;
    }
    let text = String::from_utf8_lossy(bytes);
    if text.contains('<') && text.contains('>') {
        PayloadKind::Markup
    } else if text.contains(',') {
        PayloadKind::Tabular
    } else {
        PayloadKind::PlainText
    }
}

/// 编码并追加换行分隔符（RawBytes 原样发送）
pub fn frame_line(message: &Message) -> Vec<u8> {
    let mut bytes = serialize(message);
    if message.kind() != PayloadKind::RawBytes {
        bytes.push(b'\n');
    }
    bytes
}

/// 面向帧的传输（WebSocket）上的一帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// 转换为具体协议栈的帧类型
    pub fn into_message<T: From<String> + From<Vec<u8>>>(self) -> T {
        match self {
            Frame::Text(text) => T::from(text),
            Frame::Binary(bytes) => T::from(bytes),
        }
    }
}

/// 选择帧类型：RawBytes 用二进制帧，其余格式用文本帧，不追加换行符
pub fn to_frame(message: &Message) -> Frame {
    let bytes = serialize(message);
    if message.kind() == PayloadKind::RawBytes {
        return Frame::Binary(bytes);
    }
    match String::from_utf8(bytes) {
        Ok(text) => Frame::Text(text),
        Err(e) => Frame::Binary(e.into_bytes()),
    }
}

/// 去掉一个结尾的 `\n` 或 `\r\n`（RawBytes 不处理）
pub fn trim_line(bytes: &[u8], kind: PayloadKind) -> &[u8] {
    if kind == PayloadKind::RawBytes {
        return bytes;
    }
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

/// 解码一次读取到的行数据
///
/// 开启自动识别时按内容猜测格式，否则使用 `kind`。
/// 去掉结尾换行后为空的数据返回 `None`。
pub fn decode_line(bytes: &[u8], kind: PayloadKind, auto_detect: bool) -> Option<Message> {
    let line = trim_line(bytes, kind);
    if line.is_empty() {
        return None;
    }
    let kind = if auto_detect { detect_kind(line) } else { kind };
    Some(deserialize(line, kind))
}

/// 小写十六进制编码
pub fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// 十六进制解码，忽略空白；位数为奇数时首位视为低半字节
pub fn decode_hex(input: &str) -> Option<Vec<u8>> {
    let mut digits = Vec::with_capacity(input.len() + 1);
    for c in input.chars().filter(|c| !c.is_whitespace()) {
        digits.push(c.to_digit(16)? as u8);
    }
    if digits.len() % 2 == 1 {
        digits.insert(0, 0);
    }
    Some(
        digits
            .chunks_exact(2)
            .map(|pair| (pair[0] << 4) | pair[1])
            .collect(),
    )
}

impl Message {
    /// 供界面展示的文本
    pub fn to_display_string(&self) -> String {
        match (self.kind(), self.payload()) {
            (_, Payload::Structured(value)) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
            (_, Payload::Text(text)) => text.clone(),
            (PayloadKind::RawBytes, Payload::Bytes(bytes)) => {
                format!("{} bytes: {}", bytes.len(), encode_hex(bytes))
            }
            (_, Payload::Bytes(bytes)) => encode_hex(bytes),
        }
    }
}
