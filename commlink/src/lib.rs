//! 多协议消息中心
//!
//! `Hub` 持有四种协议各自的一个客户端和一个服务端，全部接到同一个事件通道上。

use std::net::SocketAddr;

use link_client::{HttpClient, TcpClient, UdpClient, WsClient};
use link_server::{HttpServer, TcpServer, UdpServer, WsServer};
use protocol::{
    event_channel, ClientConfig, EventReceiver, Message, PayloadKind, ProtocolKind, Result,
    ServerConfig, TransportClient, TransportServer,
};
use tracing::info;

/// 八个传输实例的唯一持有者
pub struct Hub {
    tcp_client: TcpClient,
    udp_client: UdpClient,
    ws_client: WsClient,
    http_client: HttpClient,
    tcp_server: TcpServer,
    udp_server: UdpServer,
    ws_server: WsServer,
    http_server: HttpServer,
}

impl Hub {
    /// 创建全部传输，返回 Hub 和共享的事件接收端
    pub fn new(client: ClientConfig, server: ServerConfig) -> Result<(Self, EventReceiver)> {
        let (tx, rx) = event_channel();
        let hub = Self {
            tcp_client: TcpClient::new(client.clone(), tx.clone()),
            udp_client: UdpClient::new(client.clone(), tx.clone()),
            ws_client: WsClient::new(client.clone(), tx.clone()),
            http_client: HttpClient::new(client, tx.clone())?,
            tcp_server: TcpServer::new(server.clone(), tx.clone()),
            udp_server: UdpServer::new(server.clone(), tx.clone()),
            ws_server: WsServer::new(server.clone(), tx.clone()),
            http_server: HttpServer::new(server, tx),
        };
        Ok((hub, rx))
    }

    /// 切换全部传输的负载格式
    pub fn set_format(&self, kind: PayloadKind) {
        self.tcp_client.set_format(kind);
        self.udp_client.set_format(kind);
        self.ws_client.set_format(kind);
        self.http_client.set_format(kind);
        self.tcp_server.set_format(kind);
        self.udp_server.set_format(kind);
        self.ws_server.set_format(kind);
        self.http_server.set_format(kind);
        info!("Payload format set to {}", kind);
    }

    pub fn format(&self) -> PayloadKind {
        self.tcp_client.format()
    }

    /// 按协议启动服务端
    pub async fn start_server(&mut self, protocol: ProtocolKind, port: u16) -> Result<SocketAddr> {
        match protocol {
            ProtocolKind::Tcp => self.tcp_server.start(port).await,
            ProtocolKind::Udp => self.udp_server.start(port).await,
            ProtocolKind::WebSocket => self.ws_server.start(port).await,
            ProtocolKind::Http => self.http_server.start(port).await,
        }
    }

    /// 按协议连接客户端
    pub async fn connect(&mut self, protocol: ProtocolKind, endpoint: &str) -> Result<()> {
        match protocol {
            ProtocolKind::Tcp => self.tcp_client.connect(endpoint).await,
            ProtocolKind::Udp => self.udp_client.connect(endpoint).await,
            ProtocolKind::WebSocket => self.ws_client.connect(endpoint).await,
            ProtocolKind::Http => self.http_client.connect(endpoint).await,
        }
    }

    /// 通过指定协议的客户端发送
    pub async fn send(&mut self, protocol: ProtocolKind, message: &Message) -> Result<()> {
        match protocol {
            ProtocolKind::Tcp => self.tcp_client.send(message).await,
            ProtocolKind::Udp => self.udp_client.send(message).await,
            ProtocolKind::WebSocket => self.ws_client.send(message).await,
            ProtocolKind::Http => self.http_client.send(message).await,
        }
    }

    /// 通过指定协议的服务端广播
    pub async fn broadcast(&self, protocol: ProtocolKind, message: &Message) -> Result<usize> {
        match protocol {
            ProtocolKind::Tcp => self.tcp_server.send_to_all(message).await,
            ProtocolKind::Udp => self.udp_server.send_to_all(message).await,
            ProtocolKind::WebSocket => self.ws_server.send_to_all(message).await,
            ProtocolKind::Http => self.http_server.send_to_all(message).await,
        }
    }

    /// 断开所有客户端并停止所有服务端
    pub async fn shutdown(&mut self) {
        self.http_client.disconnect().await;
        self.tcp_client.disconnect().await;
        self.udp_client.disconnect().await;
        self.ws_client.disconnect().await;
        self.tcp_server.stop().await;
        self.udp_server.stop().await;
        self.ws_server.stop().await;
        self.http_server.stop().await;
        info!("All transports shut down");
    }

    pub fn tcp_client(&mut self) -> &mut TcpClient {
        &mut self.tcp_client
    }

    pub fn udp_client(&mut self) -> &mut UdpClient {
        &mut self.udp_client
    }

    pub fn ws_client(&mut self) -> &mut WsClient {
        &mut self.ws_client
    }

    pub fn http_client(&mut self) -> &mut HttpClient {
        &mut self.http_client
    }

    pub fn tcp_server(&mut self) -> &mut TcpServer {
        &mut self.tcp_server
    }

    pub fn udp_server(&mut self) -> &mut UdpServer {
        &mut self.udp_server
    }

    pub fn ws_server(&mut self) -> &mut WsServer {
        &mut self.ws_server
    }

    pub fn http_server(&mut self) -> &mut HttpServer {
        &mut self.http_server
    }
}
