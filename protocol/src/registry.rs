//! 连接注册表
//!
//! 以对端身份（`host:port`）为键保存服务端持有的连接句柄，
//! 供定向发送、广播和空闲清理使用。注册表只由服务端的调度任务访问，不需要加锁。

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{ProtocolError, Result};

/// 对端身份，格式为 `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for PeerIdentity {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<&str> for PeerIdentity {
    fn from(identity: &str) -> Self {
        Self(identity.to_string())
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
struct Entry<H> {
    handle: H,
    last_activity: Instant,
}

/// 连接注册表
#[derive(Debug)]
pub struct ConnectionRegistry<H> {
    peers: HashMap<PeerIdentity, Entry<H>>,
    max_clients: usize,
}

impl<H> ConnectionRegistry<H> {
    pub fn new(max_clients: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_clients,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_clients
    }

    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.peers.contains_key(peer)
    }

    /// 注册新连接
    ///
    /// 已满或身份重复时返回错误，并把句柄交还给调用方关闭。
    pub fn register(
        &mut self,
        peer: PeerIdentity,
        handle: H,
        now: Instant,
    ) -> std::result::Result<(), (ProtocolError, H)> {
        if self.peers.contains_key(&peer) {
            return Err((ProtocolError::DuplicatePeer(peer.to_string()), handle));
        }
        if self.is_full() {
            return Err((
                ProtocolError::CapacityExceeded {
                    max: self.max_clients,
                },
                handle,
            ));
        }
        self.peers.insert(
            peer,
            Entry {
                handle,
                last_activity: now,
            },
        );
        Ok(())
    }

    /// 移除连接，返回其句柄
    pub fn remove(&mut self, peer: &PeerIdentity) -> Option<H> {
        self.peers.remove(peer).map(|entry| entry.handle)
    }

    /// 刷新最近活动时间，对端不存在时返回 false
    pub fn touch(&mut self, peer: &PeerIdentity, now: Instant) -> bool {
        match self.peers.get_mut(peer) {
            Some(entry) => {
                entry.last_activity = now;
                true
            }
            None => false,
        }
    }

    pub fn get_mut(&mut self, peer: &PeerIdentity) -> Option<&mut H> {
        self.peers.get_mut(peer).map(|entry| &mut entry.handle)
    }

    /// 查找句柄，不存在时返回 `PeerNotFound`
    pub fn require_mut(&mut self, peer: &PeerIdentity) -> Result<&mut H> {
        self.get_mut(peer)
            .ok_or_else(|| ProtocolError::PeerNotFound(peer.to_string()))
    }

    /// 当前所有对端身份（排序后返回）
    pub fn identities(&self) -> Vec<PeerIdentity> {
        let mut ids: Vec<_> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PeerIdentity, &mut H)> {
        self.peers.iter_mut().map(|(peer, entry)| (peer, &mut entry.handle))
    }

    /// 空闲时间超过 `timeout` 的对端
    pub fn idle_peers(&self, now: Instant, timeout: Duration) -> Vec<PeerIdentity> {
        let mut idle: Vec<_> = self
            .peers
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_activity) > timeout)
            .map(|(peer, _)| peer.clone())
            .collect();
        idle.sort();
        idle
    }

    /// 清空注册表，交出所有句柄
    pub fn drain(&mut self) -> Vec<(PeerIdentity, H)> {
        self.peers
            .drain()
            .map(|(peer, entry)| (peer, entry.handle))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(300);

    fn peer(port: u16) -> PeerIdentity {
        PeerIdentity::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_identity_format() {
        assert_eq!(peer(5000).as_str(), "127.0.0.1:5000");
        assert_eq!(peer(5000).to_string(), "127.0.0.1:5000");
    }

    #[test]
    fn test_capacity_n_plus_one() {
        let now = Instant::now();
        let mut registry = ConnectionRegistry::new(3);
        let mut rejected = 0;
        for port in 1..=4 {
            if let Err((e, handle)) = registry.register(peer(port), port, now) {
                assert!(matches!(e, ProtocolError::CapacityExceeded { max: 3 }));
                assert_eq!(handle, 4);
                rejected += 1;
            }
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(rejected, 1);
        assert!(!registry.contains(&peer(4)));
    }

    #[test]
    fn test_duplicate_rejected_and_reusable_after_remove() {
        let now = Instant::now();
        let mut registry = ConnectionRegistry::new(10);
        registry.register(peer(1), "a", now).unwrap();
        assert!(matches!(
            registry.register(peer(1), "b", now),
            Err((ProtocolError::DuplicatePeer(_), "b"))
        ));
        assert_eq!(registry.remove(&peer(1)), Some("a"));
        assert_eq!(registry.remove(&peer(1)), None);
        registry.register(peer(1), "c", now).unwrap();
        assert_eq!(registry.get_mut(&peer(1)), Some(&mut "c"));
    }

    #[test]
    fn test_idle_peer_evicted_active_peer_kept() {
        let start = Instant::now();
        let mut registry = ConnectionRegistry::new(10);
        registry.register(peer(1), (), start).unwrap();
        registry.register(peer(2), (), start).unwrap();

        // peer 2 在窗口内有活动
        assert!(registry.touch(&peer(2), start + Duration::from_secs(100)));

        let sweep_at = start + IDLE + Duration::from_secs(1);
        assert_eq!(registry.idle_peers(sweep_at, IDLE), vec![peer(1)]);
    }

    #[test]
    fn test_idle_boundary_is_exclusive() {
        let start = Instant::now();
        let mut registry = ConnectionRegistry::new(10);
        registry.register(peer(1), (), start).unwrap();
        assert!(registry.idle_peers(start + IDLE, IDLE).is_empty());
    }

    #[test]
    fn test_touch_unknown_peer() {
        let mut registry: ConnectionRegistry<()> = ConnectionRegistry::new(1);
        assert!(!registry.touch(&peer(9), Instant::now()));
        assert!(matches!(
            registry.require_mut(&peer(9)),
            Err(ProtocolError::PeerNotFound(_))
        ));
    }

    #[test]
    fn test_drain_empties_registry() {
        let now = Instant::now();
        let mut registry = ConnectionRegistry::new(10);
        registry.register(peer(1), 1, now).unwrap();
        registry.register(peer(2), 2, now).unwrap();
        let mut drained = registry.drain();
        drained.sort();
        assert_eq!(drained, vec![(peer(1), 1), (peer(2), 2)]);
        assert!(registry.is_empty());
    }
}
