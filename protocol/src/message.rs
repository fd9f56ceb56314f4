//! 消息类型定义

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// 负载格式，决定消息在线路上的表示方式
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PayloadKind {
    /// 结构化文本（JSON）
    #[default]
    Structured,
    /// 标记文本（XML）
    Markup,
    /// 表格文本（CSV）
    Tabular,
    /// 纯文本
    PlainText,
    /// 原始字节
    RawBytes,
    /// 十六进制文本
    HexText,
}

impl PayloadKind {
    /// 所有格式，按界面展示顺序排列
    pub const ALL: [PayloadKind; 6] = [
        PayloadKind::Structured,
        PayloadKind::Markup,
        PayloadKind::Tabular,
        PayloadKind::PlainText,
        PayloadKind::RawBytes,
        PayloadKind::HexText,
    ];

    /// 格式名称
    pub fn name(self) -> &'static str {
        match self {
            PayloadKind::Structured => "JSON",
            PayloadKind::Markup => "XML",
            PayloadKind::Tabular => "CSV",
            PayloadKind::PlainText => "TEXT",
            PayloadKind::RawBytes => "BINARY",
            PayloadKind::HexText => "HEX",
        }
    }

    /// 负载是否以 UTF-8 文本形式保存
    pub fn is_text(self) -> bool {
        matches!(
            self,
            PayloadKind::Markup | PayloadKind::Tabular | PayloadKind::PlainText
        )
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PayloadKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "structured" => Ok(PayloadKind::Structured),
            "xml" | "markup" => Ok(PayloadKind::Markup),
            "csv" | "tabular" => Ok(PayloadKind::Tabular),
            "text" | "plaintext" | "plain" => Ok(PayloadKind::PlainText),
            "binary" | "rawbytes" | "raw" => Ok(PayloadKind::RawBytes),
            "hex" | "hextext" => Ok(PayloadKind::HexText),
            other => Err(ProtocolError::InvalidInput {
                kind: "format",
                reason: format!("unknown payload kind '{other}'"),
            }),
        }
    }
}

/// 负载的具体表示
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// JSON 值
    Structured(Value),
    /// UTF-8 文本
    Text(String),
    /// 字节序列
    Bytes(Vec<u8>),
}

/// 与协议无关的消息信封
///
/// 负载的表示完全由 `kind` 决定，只能通过对应的构造函数创建，
/// 构造后不可修改。
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: PayloadKind,
    payload: Payload,
}

impl Message {
    pub fn structured(value: Value) -> Self {
        Self {
            kind: PayloadKind::Structured,
            payload: Payload::Structured(value),
        }
    }

    pub fn markup(text: impl Into<String>) -> Self {
        Self::text_of(PayloadKind::Markup, text)
    }

    pub fn tabular(text: impl Into<String>) -> Self {
        Self::text_of(PayloadKind::Tabular, text)
    }

    pub fn plain_text(text: impl Into<String>) -> Self {
        Self::text_of(PayloadKind::PlainText, text)
    }

    pub fn raw_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: PayloadKind::RawBytes,
            payload: Payload::Bytes(bytes.into()),
        }
    }

    pub fn hex_text(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: PayloadKind::HexText,
            payload: Payload::Bytes(bytes.into()),
        }
    }

    /// 按文本格式构造消息
    ///
    /// `kind` 不是文本格式时退化为纯文本。
    pub fn text_of(kind: PayloadKind, text: impl Into<String>) -> Self {
        let kind = if kind.is_text() {
            kind
        } else {
            PayloadKind::PlainText
        };
        Self {
            kind,
            payload: Payload::Text(text.into()),
        }
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// 以 JSON 值访问负载
    pub fn as_json(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Structured(value) => Some(value),
            _ => None,
        }
    }

    /// 以文本访问负载
    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// 以字节访问负载
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}
