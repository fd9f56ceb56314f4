//! 连接统计

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// 收发计数与在线时长
#[derive(Debug, Default)]
pub struct ConnectionStats {
    sent: AtomicU64,
    received: AtomicU64,
    started: Mutex<Option<Instant>>,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// 连接建立：清零计数并开始计时
    pub fn connection_started(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.received.store(0, Ordering::Relaxed);
        if let Ok(mut started) = self.started.lock() {
            *started = Some(Instant::now());
        }
    }

    /// 连接结束：停止计时，保留计数
    pub fn connection_stopped(&self) {
        if let Ok(mut started) = self.started.lock() {
            *started = None;
        }
    }

    /// 在线时长，未连接时为零
    pub fn uptime(&self) -> Duration {
        self.started
            .lock()
            .ok()
            .and_then(|started| started.map(|at| at.elapsed()))
            .unwrap_or_default()
    }
}
