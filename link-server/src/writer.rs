//! 对端写任务
//!
//! 调度任务从不直接写套接字：每个对端有一个写任务，从有界队列取出数据写出。
//! 入队不等待，队列已满或写任务已退出时入队失败，调度任务据此断开该对端。
//! 写队列的发送端被丢弃后，写任务写完队列中剩余的数据再关闭输出。

use std::future::Future;
use std::io;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use protocol::{PeerIdentity, ProtocolError, Result, PEER_QUEUE_CAPACITY};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// 写任务的输出端
pub(crate) trait PeerSink: Send + 'static {
    type Item: Send + 'static;

    /// 写出一项
    fn deliver(&mut self, item: Self::Item) -> impl Future<Output = io::Result<()>> + Send;

    /// 队列关闭后收尾
    fn finish(&mut self) -> impl Future<Output = ()> + Send;
}

impl PeerSink for OwnedWriteHalf {
    type Item = Vec<u8>;

    async fn deliver(&mut self, item: Vec<u8>) -> io::Result<()> {
        self.write_all(&item).await?;
        self.flush().await
    }

    async fn finish(&mut self) {
        let _ = self.shutdown().await;
    }
}

impl PeerSink for SplitSink<WebSocketStream<TcpStream>, WsMessage> {
    type Item = WsMessage;

    async fn deliver(&mut self, item: WsMessage) -> io::Result<()> {
        self.send(item)
            .await
            .map_err(|e| io::Error::other(e.to_string()))
    }

    /// 发送 Close 帧
    async fn finish(&mut self) {
        let _ = self.close().await;
    }
}

/// 对端写队列的发送端
pub(crate) struct PeerWriter<T> {
    peer: PeerIdentity,
    queue: mpsc::Sender<T>,
}

impl<T: Send + 'static> PeerWriter<T> {
    /// 启动写任务
    ///
    /// 写出失败或超过 `write_timeout` 时调用一次 `on_failure` 并退出，
    /// 队列中剩余的数据被丢弃。
    pub(crate) fn spawn<S>(
        peer: PeerIdentity,
        mut sink: S,
        write_timeout: Duration,
        on_failure: impl FnOnce(PeerIdentity, String) + Send + 'static,
    ) -> Self
    where
        S: PeerSink<Item = T>,
    {
        let (queue, mut pending) = mpsc::channel::<T>(PEER_QUEUE_CAPACITY);
        let owner = peer.clone();
        tokio::spawn(async move {
            while let Some(item) = pending.recv().await {
                let error = match timeout(write_timeout, sink.deliver(item)).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => format!("write timed out after {}ms", write_timeout.as_millis()),
                };
                on_failure(owner, error);
                return;
            }
            if timeout(write_timeout, sink.finish()).await.is_err() {
                debug!("Closing output to {} timed out", owner);
            }
        });
        Self { peer, queue }
    }

    /// 入队，不等待写出
    pub(crate) fn push(&self, item: T) -> Result<()> {
        self.queue.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => ProtocolError::QueueFull(self.peer.to_string()),
            TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_queued_data_is_written_before_close() {
        let (server, mut client) = pair().await;
        let (_read, write) = server.into_split();
        let peer = PeerIdentity::from("127.0.0.1:1");
        let writer = PeerWriter::spawn(peer, write, Duration::from_secs(1), |_, _| {});

        writer.push(b"one\n".to_vec()).unwrap();
        writer.push(b"two\n".to_vec()).unwrap();
        drop(writer);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"one\ntwo\n");
    }

    #[tokio::test]
    async fn test_full_queue_is_an_error() {
        let (server, _client) = pair().await;
        let (_read, write) = server.into_split();
        let peer = PeerIdentity::from("127.0.0.1:2");
        let writer = PeerWriter::spawn(peer, write, Duration::from_secs(30), |_, _| {});

        // 对端从不读取，写任务终将阻塞，队列随之写满
        let chunk = vec![0u8; 256 * 1024];
        let mut result = Ok(());
        for _ in 0..400 {
            result = writer.push(chunk.clone());
            if result.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(matches!(result, Err(ProtocolError::QueueFull(_))));
    }

    #[tokio::test]
    async fn test_write_timeout_reports_failure() {
        let (server, _client) = pair().await;
        let (_read, write) = server.into_split();
        let peer = PeerIdentity::from("127.0.0.1:3");
        let (failed_tx, mut failed) = mpsc::unbounded_channel();
        let writer = PeerWriter::spawn(peer, write, Duration::from_millis(200), move |peer, error| {
            let _ = failed_tx.send((peer, error));
        });

        let chunk = vec![0u8; 256 * 1024];
        for _ in 0..200 {
            if writer.push(chunk.clone()).is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let (peer, error) = tokio::time::timeout(Duration::from_secs(5), failed.recv())
            .await
            .expect("writer never gave up")
            .unwrap();
        assert_eq!(peer.as_str(), "127.0.0.1:3");
        assert!(error.contains("timed out"));
    }
}
