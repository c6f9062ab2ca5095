//! Per-IP WebSocket connection rate limiter.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);

type Window = HashMap<IpAddr, Vec<Instant>>;

/// Sliding one-minute window of connection attempts per client address.
pub struct RateLimiter {
    max_connections_per_ip: u32,
    connections: Arc<Mutex<Window>>,
}

fn lock(map: &Mutex<Window>) -> MutexGuard<'_, Window> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RateLimiter {
    pub fn new(max_connections_per_ip: u32) -> Self {
        let limiter = Self {
            max_connections_per_ip,
            connections: Arc::new(Mutex::new(HashMap::new())),
        };

        let connections = Arc::downgrade(&limiter.connections);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(WINDOW).await;
                let Some(connections) = connections.upgrade() else {
                    break;
                };
                let mut map = lock(&connections);
                let cutoff = Instant::now() - WINDOW;
                map.retain(|_, stamps| {
                    stamps.retain(|t| *t > cutoff);
                    !stamps.is_empty()
                });
                debug!(entries = map.len(), "Rate limiter cleanup");
            }
        });

        limiter
    }

    /// Record an attempt from `ip`. Returns false when it is over the limit.
    pub fn check(&self, ip: IpAddr) -> bool {
        let mut map = lock(&self.connections);
        let cutoff = Instant::now() - WINDOW;
        let stamps = map.entry(ip).or_default();
        stamps.retain(|t| *t > cutoff);

        if stamps.len() >= self.max_connections_per_ip as usize {
            warn!(%ip, count = stamps.len(), limit = self.max_connections_per_ip,
                "Rate limited: too many connections from IP");
            return false;
        }
        stamps.push(Instant::now());
        true
    }

    /// Give back the oldest slot for `ip` once its connection has closed.
    pub fn release(&self, ip: IpAddr) {
        let mut map = lock(&self.connections);
        if let Some(stamps) = map.get_mut(&ip) {
            if !stamps.is_empty() {
                stamps.remove(0);
            }
            if stamps.is_empty() {
                map.remove(&ip);
            }
        }
    }
}
