//! 格式协商
//!
//! 根据 Content-Type / Accept 头选择负载格式。

use crate::message::PayloadKind;

impl PayloadKind {
    /// 对应的 MIME 类型
    pub fn mime_type(self) -> &'static str {
        match self {
            PayloadKind::Structured => "application/json",
            PayloadKind::Markup => "application/xml",
            PayloadKind::Tabular => "text/csv",
            PayloadKind::PlainText => "text/plain; charset=utf-8",
            PayloadKind::RawBytes => "application/octet-stream",
            PayloadKind::HexText => "text/x-hex",
        }
    }

    /// 识别单个 MIME 类型（不含参数）
    pub fn from_mime(mime: &str) -> Option<PayloadKind> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence.to_ascii_lowercase().as_str() {
            "application/json" | "text/json" => Some(PayloadKind::Structured),
            "application/xml" | "text/xml" | "text/html" => Some(PayloadKind::Markup),
            "text/csv" | "application/csv" => Some(PayloadKind::Tabular),
            "text/plain" => Some(PayloadKind::PlainText),
            "application/octet-stream" => Some(PayloadKind::RawBytes),
            "text/x-hex" | "application/x-hex" => Some(PayloadKind::HexText),
            _ => None,
        }
    }
}

/// 根据头部值选择格式
///
/// 值可以是逗号分隔的列表，取第一个可识别的条目；
/// 缺失、为空、`*/*` 或无法识别时返回 `default`。
pub fn negotiate(header: Option<&str>, default: PayloadKind) -> PayloadKind {
    header
        .into_iter()
        .flat_map(|value| value.split(','))
        .find_map(PayloadKind::from_mime)
        .unwrap_or(default)
}
