//! 多协议消息命令行工具
//!
//! - `serve`: 启动一种协议的服务端并打印所有事件
//! - `send`: 连接后发送一条消息，并在短时间内打印回复
//! - `poll`: 对 HTTP 地址进行长轮询

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use commlink::Hub;
use link_client::HttpMethod;
use protocol::{
    codec, ClientConfig, EventReceiver, PayloadKind, ProtocolKind, ServerConfig, TransportEvent,
    IDLE_TIMEOUT_SECS, MAX_CLIENTS, POLL_INTERVAL_MS,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "commlink",
    version,
    about = "Multi-protocol messaging over TCP, UDP, WebSocket and HTTP"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动服务端
    Serve(ServeArgs),
    /// 发送一条消息
    Send(SendArgs),
    /// HTTP 长轮询
    Poll(PollArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Transport {
    Tcp,
    Udp,
    Ws,
    Http,
}

impl From<Transport> for ProtocolKind {
    fn from(transport: Transport) -> Self {
        match transport {
            Transport::Tcp => ProtocolKind::Tcp,
            Transport::Udp => ProtocolKind::Udp,
            Transport::Ws => ProtocolKind::WebSocket,
            Transport::Http => ProtocolKind::Http,
        }
    }
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, value_enum, env = "COMMLINK_PROTOCOL", default_value = "tcp")]
    protocol: Transport,

    #[arg(long, env = "COMMLINK_PORT", default_value_t = 5000)]
    port: u16,

    #[arg(long, env = "COMMLINK_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// json, xml, csv, text, binary, hex
    #[arg(long, env = "COMMLINK_FORMAT", default_value = "json")]
    format: PayloadKind,

    #[arg(long, env = "COMMLINK_MAX_CLIENTS", default_value_t = MAX_CLIENTS)]
    max_clients: usize,

    /// 空闲超时（秒）
    #[arg(long, env = "COMMLINK_IDLE_TIMEOUT", default_value_t = IDLE_TIMEOUT_SECS)]
    idle_timeout: u64,

    /// 按内容自动识别入站格式
    #[arg(long, env = "COMMLINK_AUTO_DETECT")]
    auto_detect: bool,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long, value_enum, env = "COMMLINK_PROTOCOL", default_value = "tcp")]
    protocol: Transport,

    /// TCP/UDP 为 host:port，WebSocket/HTTP 为 URL
    #[arg(long, env = "COMMLINK_ENDPOINT")]
    endpoint: String,

    #[arg(long, env = "COMMLINK_FORMAT", default_value = "json")]
    format: PayloadKind,

    /// HTTP 请求方法
    #[arg(long, env = "COMMLINK_METHOD", default_value = "POST")]
    method: HttpMethod,

    /// 发送后等待回复的时间（毫秒）
    #[arg(long, default_value_t = 1000)]
    wait_ms: u64,

    /// 消息内容
    input: String,
}

#[derive(Args, Debug)]
struct PollArgs {
    #[arg(long, env = "COMMLINK_URL")]
    url: String,

    #[arg(long, env = "COMMLINK_POLL_INTERVAL_MS", default_value_t = POLL_INTERVAL_MS)]
    interval_ms: u64,

    #[arg(long, env = "COMMLINK_FORMAT", default_value = "json")]
    format: PayloadKind,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("commlink=info".parse()?)
                .add_directive("link_server=info".parse()?)
                .add_directive("link_client=info".parse()?)
                .add_directive("protocol=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Send(args) => send(args).await,
        Command::Poll(args) => poll(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let server = ServerConfig {
        bind_host: args.bind,
        max_clients: args.max_clients,
        idle_timeout: Duration::from_secs(args.idle_timeout),
        format: args.format,
        auto_detect: args.auto_detect,
        ..ServerConfig::default()
    };
    let (mut hub, mut events) = Hub::new(ClientConfig::default(), server)?;
    hub.set_format(args.format);

    let protocol = ProtocolKind::from(args.protocol);
    let addr = hub
        .start_server(protocol, args.port)
        .await
        .with_context(|| format!("failed to start {protocol} server on port {}", args.port))?;
    info!("{} server ready on {} (Ctrl+C to stop)", protocol, addr);

    loop {
        tokio::select! {
            Some(event) = events.recv() => log_event(&event),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    hub.shutdown().await;
    drain(&mut events);
    Ok(())
}

async fn send(args: SendArgs) -> Result<()> {
    let message = codec::parse_input(&args.input, args.format)
        .with_context(|| format!("input is not valid {}", args.format))?;

    let client = ClientConfig {
        format: args.format,
        ..ClientConfig::default()
    };
    let (mut hub, mut events) = Hub::new(client, ServerConfig::default())?;
    hub.http_client().set_method(args.method);

    let protocol = ProtocolKind::from(args.protocol);
    hub.connect(protocol, &args.endpoint)
        .await
        .with_context(|| format!("failed to connect to {}", args.endpoint))?;
    hub.send(protocol, &message).await.context("send failed")?;
    info!("Sent {} message via {}", message.kind(), protocol);

    let deadline = tokio::time::sleep(Duration::from_millis(args.wait_ms));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            Some(event) = events.recv() => log_event(&event),
            _ = &mut deadline => break,
        }
    }

    hub.shutdown().await;
    drain(&mut events);
    Ok(())
}

async fn poll(args: PollArgs) -> Result<()> {
    let client = ClientConfig {
        format: args.format,
        poll_interval: Duration::from_millis(args.interval_ms),
        ..ClientConfig::default()
    };
    let interval = client.poll_interval;
    let (mut hub, mut events) = Hub::new(client, ServerConfig::default())?;
    hub.http_client().start_polling(&args.url, interval).await;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                log_event(&event);
                if matches!(event, TransportEvent::PollingStopped { .. }) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    hub.shutdown().await;
    drain(&mut events);
    Ok(())
}

/// 打印关闭过程中产生的剩余事件
fn drain(events: &mut EventReceiver) {
    while let Ok(event) = events.try_recv() {
        log_event(&event);
    }
}

fn log_event(event: &TransportEvent) {
    match event {
        TransportEvent::Message {
            protocol,
            message,
            source,
            timestamp,
        } => info!(
            "[{}] {} {} from {}:\n{}",
            timestamp.format("%H:%M:%S"),
            protocol,
            message.kind(),
            source,
            message.to_display_string()
        ),
        TransportEvent::Connected { protocol } => info!("{} connected", protocol),
        TransportEvent::Disconnected { protocol } => info!("{} disconnected", protocol),
        TransportEvent::PeerConnected { protocol, peer } => {
            info!("{} peer {} connected", protocol, peer)
        }
        TransportEvent::PeerDisconnected { protocol, peer } => {
            info!("{} peer {} disconnected", protocol, peer)
        }
        TransportEvent::Error {
            protocol,
            description,
        } => warn!("{} error: {}", protocol, description),
        TransportEvent::PollingStopped { protocol, reason } => {
            error!("{} polling stopped: {}", protocol, reason)
        }
    }
}
