//! 服务端公共控制层
//!
//! 每个服务端由一个调度任务独占监听套接字和连接注册表，
//! 外部调用通过命令通道发给调度任务，并经 oneshot 取回结果。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::{
    ConnectionStats, Emitter, Message, PayloadKind, PeerIdentity, ProtocolError, ProtocolKind,
    Result, ServerConfig, TransportEvent,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 命令通道容量
const COMMAND_CAPACITY: usize = 32;

/// 等待调度任务自行退出的时间，超时后强制终止
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// 发给调度任务的命令
#[derive(Debug)]
pub(crate) enum Command {
    /// 广播
    SendToAll {
        message: Message,
        reply: oneshot::Sender<Result<usize>>,
    },
    /// 定向发送
    SendToPeer {
        peer: PeerIdentity,
        message: Message,
        reply: oneshot::Sender<Result<()>>,
    },
    /// 查询对端列表
    Peers {
        reply: oneshot::Sender<Vec<PeerIdentity>>,
    },
    /// 停止服务
    Shutdown,
}

/// 正在运行的调度任务
struct Running {
    local_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// 四种服务端共用的状态与控制逻辑
pub(crate) struct ServerCore {
    pub(crate) config: ServerConfig,
    pub(crate) emitter: Emitter,
    pub(crate) stats: Arc<ConnectionStats>,
    format: watch::Sender<PayloadKind>,
    running: Option<Running>,
}

impl ServerCore {
    pub(crate) fn new(
        protocol: ProtocolKind,
        config: ServerConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (format, _) = watch::channel(config.format);
        Self {
            config,
            emitter: Emitter::new(protocol, events),
            stats: Arc::new(ConnectionStats::new()),
            format,
            running: None,
        }
    }

    pub(crate) fn protocol(&self) -> ProtocolKind {
        self.emitter.protocol()
    }

    /// 创建命令通道
    pub(crate) fn command_channel() -> (mpsc::Sender<Command>, mpsc::Receiver<Command>) {
        mpsc::channel(COMMAND_CAPACITY)
    }

    /// 调度任务读取格式的接收端
    pub(crate) fn format_rx(&self) -> watch::Receiver<PayloadKind> {
        self.format.subscribe()
    }

    pub(crate) fn set_format(&self, kind: PayloadKind) {
        self.format.send_replace(kind);
        debug!("{} server format set to {}", self.protocol(), kind);
    }

    pub(crate) fn format(&self) -> PayloadKind {
        *self.format.borrow()
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// 报告启动失败
    pub(crate) fn setup_failed(&self, port: u16, error: ProtocolError) -> ProtocolError {
        self.emitter
            .error(format!("Failed to listen on port {port}: {error}"));
        error
    }

    /// 记录新启动的调度任务
    pub(crate) fn launch(
        &mut self,
        local_addr: SocketAddr,
        commands: mpsc::Sender<Command>,
        task: JoinHandle<()>,
    ) {
        self.stats.connection_started();
        info!("{} server listening on {}", self.protocol(), local_addr);
        self.running = Some(Running {
            local_addr,
            commands,
            task,
        });
    }

    /// 停止调度任务并等待其退出
    pub(crate) async fn stop(&mut self) {
        let Some(Running {
            local_addr,
            commands,
            mut task,
        }) = self.running.take()
        else {
            return;
        };
        let stopped = timeout(STOP_TIMEOUT, async {
            let _ = commands.send(Command::Shutdown).await;
            let _ = (&mut task).await;
        })
        .await;
        if stopped.is_err() {
            warn!(
                "{} server on {} did not stop in time, aborting",
                self.protocol(),
                local_addr
            );
            task.abort();
            let _ = task.await;
        }
        self.stats.connection_stopped();
        info!("{} server on {} stopped", self.protocol(), local_addr);
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let commands = match &self.running {
            Some(running) if !running.task.is_finished() => running.commands.clone(),
            _ => {
                self.emitter.error(ProtocolError::NotListening);
                return Err(ProtocolError::NotListening);
            }
        };
        let (reply, response) = oneshot::channel();
        commands
            .send(build(reply))
            .await
            .map_err(|_| ProtocolError::NotListening)?;
        response.await.map_err(|_| ProtocolError::NotListening)
    }

    pub(crate) async fn send_to_all(&self, message: &Message) -> Result<usize> {
        let message = message.clone();
        self.request(|reply| Command::SendToAll { message, reply })
            .await?
    }

    pub(crate) async fn send_to_peer(&self, peer: &PeerIdentity, message: &Message) -> Result<()> {
        let peer = peer.clone();
        let message = message.clone();
        self.request(|reply| Command::SendToPeer {
            peer,
            message,
            reply,
        })
        .await?
    }

    pub(crate) async fn peers(&self) -> Result<Vec<PeerIdentity>> {
        self.request(|reply| Command::Peers { reply }).await
    }
}

impl Drop for ServerCore {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
        }
    }
}
