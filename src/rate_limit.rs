//! Fixed-window request counter per client identity.
//!
//! Each identity gets its own mutex, so concurrent requests from the same
//! client serialize on the increment-and-compare while different clients
//! never wait on each other. The outer map lock is only taken for writing
//! when an identity is seen for the first time or during eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy)]
pub struct RateWindowState {
    pub window_start: Instant,
    pub count: u32,
}

pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    clients: RwLock<HashMap<String, Arc<Mutex<RateWindowState>>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(Duration::from_secs(config.window_secs), config.max_requests)
    }

    /// Counts one request for `client` and returns whether it is within quota.
    pub fn allow(&self, client: &str) -> bool {
        self.allow_at(client, Instant::now())
    }

    pub(crate) fn allow_at(&self, client: &str, now: Instant) -> bool {
        let slot = self.slot(client, now);
        let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());

        if now.saturating_duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count = 0;
        }
        state.count = state.count.saturating_add(1);
        state.count <= self.max_requests
    }

    fn slot(&self, client: &str, now: Instant) -> Arc<Mutex<RateWindowState>> {
        {
            let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = clients.get(client) {
                return Arc::clone(slot);
            }
        }
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(clients.entry(client.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(RateWindowState {
                window_start: now,
                count: 0,
            }))
        }))
    }

    /// Drops identities whose current window started more than `max_idle` ago.
    /// Returns how many were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.evict_idle_at(max_idle, Instant::now())
    }

    pub(crate) fn evict_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        let before = clients.len();
        clients.retain(|_, slot| {
            let state = slot.lock().unwrap_or_else(|e| e.into_inner());
            now.saturating_duration_since(state.window_start) < max_idle
        });
        let evicted = before - clients.len();
        if evicted > 0 {
            debug!("Rate limiter evicted {evicted} idle clients");
        }
        evicted
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Current window state for `client`, if tracked.
    #[cfg(test)]
    pub fn state(&self, client: &str) -> Option<RateWindowState> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        clients
            .get(client)
            .map(|slot| *slot.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
