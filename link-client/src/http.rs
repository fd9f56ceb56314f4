//! HTTP 客户端
//!
//! HTTP 无状态，`connect` 只校验并记录基础 URL。除单次请求外还支持长轮询：
//! 按固定间隔发送 GET，连续失败达到上限后自动停止并发出 `PollingStopped`。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use protocol::{
    codec, negotiate, ClientConfig, ConnectionStats, Emitter, Message, PayloadKind,
    ProtocolError, ProtocolKind, Result, TransportClient, TransportEvent,
};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::state::ClientCore;

/// 支持的请求方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 7] = [
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Delete,
        HttpMethod::Patch,
        HttpMethod::Head,
        HttpMethod::Options,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        HttpMethod::ALL
            .into_iter()
            .find(|method| method.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ProtocolError::InvalidInput {
                kind: "method",
                reason: format!("unsupported HTTP method '{s}'"),
            })
    }
}

/// 发送请求所需的共享部分，可复制到后台任务
#[derive(Clone)]
struct Requester {
    client: reqwest::Client,
    emitter: Emitter,
    stats: Arc<ConnectionStats>,
    format: watch::Receiver<PayloadKind>,
}

impl Requester {
    /// 发送请求并解码响应；响应体为空时返回 `None`
    async fn execute(
        &self,
        url: &str,
        method: HttpMethod,
        body: Option<&Message>,
    ) -> Result<Option<Message>> {
        let format = *self.format.borrow();
        let mut builder = self
            .client
            .request(method.to_reqwest(), url)
            .header(ACCEPT, format.mime_type());
        if let Some(message) = body {
            builder = builder
                .header(CONTENT_TYPE, message.kind().mime_type())
                .body(codec::serialize(message));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProtocolError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProtocolError::HttpStatus {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }
        if body.is_some() {
            self.stats.record_sent();
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProtocolError::Request(e.to_string()))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let kind = negotiate(content_type.as_deref(), format);
        Ok(Some(codec::deserialize(&bytes, kind)))
    }

    /// 发送请求，把响应作为消息事件、把失败作为错误事件报告
    async fn exchange(
        &self,
        url: &str,
        method: HttpMethod,
        body: Option<&Message>,
    ) -> Result<Option<Message>> {
        debug!("{} {}", method, url);
        match self.execute(url, method, body).await {
            Ok(response) => {
                if let Some(message) = &response {
                    self.stats.record_received();
                    self.emitter.message(message.clone(), url);
                }
                Ok(response)
            }
            Err(e) => {
                self.emitter.error(format!("{method} {url} failed: {e}"));
                Err(e)
            }
        }
    }
}

struct Polling {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// HTTP 客户端
pub struct HttpClient {
    core: ClientCore,
    client: reqwest::Client,
    base_url: Option<String>,
    method: HttpMethod,
    polling: Option<Polling>,
}

impl HttpClient {
    /// 创建客户端，请求与连接超时取自配置
    ///
    /// 底层 HTTP 客户端（含 TLS）初始化失败时返回错误。
    pub fn new(config: ClientConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ProtocolError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            core: ClientCore::new(ProtocolKind::Http, config, events),
            client,
            base_url: None,
            method: HttpMethod::default(),
            polling: None,
        })
    }

    /// `send` 使用的请求方法
    pub fn set_method(&mut self, method: HttpMethod) {
        self.method = method;
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    fn requester(&self) -> Requester {
        Requester {
            client: self.client.clone(),
            emitter: self.core.emitter.clone(),
            stats: Arc::clone(&self.core.stats),
            format: self.core.format_rx(),
        }
    }

    /// 发送一次请求并等待响应
    pub async fn request(
        &self,
        url: &str,
        method: HttpMethod,
        body: Option<&Message>,
    ) -> Result<Option<Message>> {
        self.requester().exchange(url, method, body).await
    }

    /// 在后台发送一次请求，结果通过事件报告
    pub fn send_request(
        &self,
        url: &str,
        method: HttpMethod,
        body: Option<Message>,
    ) -> JoinHandle<()> {
        let requester = self.requester();
        let url = url.to_string();
        tokio::spawn(async move {
            let _ = requester.exchange(&url, method, body.as_ref()).await;
        })
    }

    /// 开始长轮询，已有的轮询先被停止
    pub async fn start_polling(&mut self, url: &str, period: Duration) {
        self.stop_polling().await;

        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(poll_loop(
            self.requester(),
            url.to_string(),
            period,
            self.core.config.max_poll_errors,
            signal,
        ));
        self.polling = Some(Polling { shutdown, task });
        info!("Polling {} every {}ms", url, period.as_millis());
    }

    /// 停止长轮询，同时取消正在进行的请求
    pub async fn stop_polling(&mut self) {
        if let Some(polling) = self.polling.take() {
            let _ = polling.shutdown.send(true);
            let _ = polling.task.await;
            info!("Polling stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.polling
            .as_ref()
            .is_some_and(|polling| !polling.task.is_finished())
    }
}

fn validate_url(url: &str) -> Result<()> {
    let parsed =
        reqwest::Url::parse(url).map_err(|_| ProtocolError::InvalidEndpoint(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        _ => Err(ProtocolError::InvalidEndpoint(url.to_string())),
    }
}

impl TransportClient for HttpClient {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Http
    }

    async fn connect(&mut self, endpoint: &str) -> Result<()> {
        self.disconnect().await;
        validate_url(endpoint).map_err(|e| self.core.connect_failed(endpoint, e))?;
        let _ = self.core.open(endpoint);
        self.base_url = Some(endpoint.to_string());
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.stop_polling().await;
        self.base_url = None;
        self.core.close().await;
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        self.core.require_connected()?;
        let Some(url) = self.base_url.as_deref() else {
            return Err(ProtocolError::NotConnected);
        };
        self.request(url, self.method, Some(message)).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn set_format(&self, kind: PayloadKind) {
        self.core.set_format(kind);
    }

    fn format(&self) -> PayloadKind {
        self.core.format()
    }

    fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.core.stats)
    }
}

/// 轮询任务
///
/// 停止信号在等待间隔和等待响应时都会被检查，停止后不会再发出请求。
async fn poll_loop(
    requester: Requester,
    url: String,
    period: Duration,
    max_errors: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = requester.exchange(&url, HttpMethod::Get, None) => result,
        };

        match result {
            Ok(_) => failures = 0,
            Err(_) => {
                failures += 1;
                if failures >= max_errors {
                    let reason = format!("Server not responding after {failures} attempts");
                    warn!("Polling {} stopped: {}", url, reason);
                    requester.emitter.polling_stopped(reason);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{event_channel, EventReceiver, RequestBuffer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn next_event(rx: &mut EventReceiver) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// 对每个连接读一次请求并回复固定响应
    async fn canned_server(status: &'static str, content_type: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    // 读完整个请求再回复，避免未读数据触发 RST
                    let mut request = RequestBuffer::new();
                    let mut buf = vec![0u8; 8192];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            return;
                        }
                        request.extend(&buf[..n]);
                        if matches!(request.next_request(), Ok(Some(_))) {
                            break;
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}/")
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            poll_interval: Duration::from_millis(50),
            request_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("PATCH".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!("TRACE".parse::<HttpMethod>().is_err());
        assert_eq!(HttpMethod::default(), HttpMethod::Post);
    }

    #[tokio::test]
    async fn test_connect_validates_url() {
        let (tx, mut rx) = event_channel();
        let mut client = HttpClient::new(fast_config(), tx).unwrap();
        assert!(client.connect("ftp://host").await.is_err());
        assert!(client.connect("not a url").await.is_err());
        assert!(!client.is_connected());
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Error { .. }));

        client.connect("http://127.0.0.1:8080/api").await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.base_url(), Some("http://127.0.0.1:8080/api"));
    }

    #[tokio::test]
    async fn test_response_kind_from_content_type() {
        let url = canned_server("200 OK", "text/csv", "a,b\n1,2").await;
        let (tx, mut rx) = event_channel();
        let client = HttpClient::new(fast_config(), tx).unwrap();

        let response = client
            .request(&url, HttpMethod::Get, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.kind(), PayloadKind::Tabular);
        assert_eq!(response.as_text(), Some("a,b\n1,2"));
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Message { source, .. } if source == url
        ));
    }

    #[tokio::test]
    async fn test_send_posts_to_base_url() {
        let url = canned_server("200 OK", "application/json", "{\"status\":\"received\"}").await;
        let (tx, mut rx) = event_channel();
        let mut client = HttpClient::new(fast_config(), tx).unwrap();
        client.connect(&url).await.unwrap();
        next_event(&mut rx).await;

        client
            .send(&Message::structured(serde_json::json!({"a": 1})))
            .await
            .unwrap();
        match next_event(&mut rx).await {
            TransportEvent::Message { message, .. } => {
                assert_eq!(message.as_json().unwrap()["status"], "received");
            }
            other => panic!("Unexpected event: {other:?}"),
        }
        assert_eq!(client.stats().sent(), 1);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let url = canned_server("503 Service Unavailable", "text/plain", "busy").await;
        let (tx, mut rx) = event_channel();
        let client = HttpClient::new(fast_config(), tx).unwrap();

        let result = client.request(&url, HttpMethod::Get, None).await;
        assert!(matches!(
            result,
            Err(ProtocolError::HttpStatus { status: 503, .. })
        ));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_polling_stops_after_max_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = event_channel();
        let mut client = HttpClient::new(fast_config(), tx).unwrap();
        client
            .start_polling(&format!("http://{addr}/poll"), Duration::from_millis(50))
            .await;

        let mut errors = 0;
        loop {
            match next_event(&mut rx).await {
                TransportEvent::Error { .. } => errors += 1,
                TransportEvent::PollingStopped { reason, .. } => {
                    assert_eq!(reason, "Server not responding after 3 attempts");
                    break;
                }
                other => panic!("Unexpected event: {other:?}"),
            }
        }
        assert_eq!(errors, 3);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert!(!client.is_polling());
    }

    #[tokio::test]
    async fn test_stop_polling_prevents_further_requests() {
        let url = canned_server("200 OK", "text/plain", "tick").await;
        let (tx, mut rx) = event_channel();
        let mut client = HttpClient::new(fast_config(), tx).unwrap();

        client.start_polling(&url, Duration::from_millis(50)).await;
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Message { .. }
        ));
        assert!(client.is_polling());

        client.stop_polling().await;
        assert!(!client.is_polling());
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_timeout_from_config() {
        // 接受连接但从不回复
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let (tx, mut rx) = event_channel();
        let config = ClientConfig {
            request_timeout: Duration::from_millis(300),
            ..ClientConfig::default()
        };
        let client = HttpClient::new(config, tx).unwrap();

        let started = tokio::time::Instant::now();
        let result = client
            .request(&format!("http://{addr}/"), HttpMethod::Get, None)
            .await;
        assert!(matches!(result, Err(ProtocolError::Request(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Error { .. }));
    }
}
