//! Bounded pool of recycled [`AudioPort`]s.
//!
//! Ports are expensive to create on the native side, but reusing one forever
//! without limit hides a slow native-resource leak. This pool caps both how
//! many idle ports it keeps around and how many times any one port may be
//! recycled before it's replaced with a fresh instance.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::{AudioPort, PullSource};

/// Maximum number of idle ports retained between calls.
pub const MAX_POOL_SIZE: usize = 3;
/// Maximum number of times a single port is recycled before it's discarded.
pub const MAX_REUSE_COUNT: u32 = 5;

/// Pool of idle [`AudioPort`]s, reused across successive calls on the same line.
#[derive(Default)]
pub struct PortPool {
    idle: Mutex<Vec<Arc<AudioPort>>>,
}

impl PortPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self { idle: Mutex::new(Vec::new()) }
    }

    /// Acquire a port for a new call, arming it with `ready_event` and an
    /// optional pull-mode `bridge`.
    ///
    /// Reuses an idle port when one is available and under its reuse
    /// ceiling; otherwise builds a fresh port.
    pub fn acquire(&self, ready_event: Arc<Notify>, bridge: Option<Arc<dyn PullSource>>) -> Arc<AudioPort> {
        let candidate = self.idle.lock().pop();
        let port = match candidate {
            Some(port) if port.reuse_count() < MAX_REUSE_COUNT => {
                port.bump_reuse();
                debug!(reuse_count = port.reuse_count(), "reusing pooled audio port");
                port
            }
            Some(_) => {
                debug!("pooled audio port hit reuse ceiling, replacing");
                Arc::new(AudioPort::new())
            }
            None => Arc::new(AudioPort::new()),
        };
        port.prepare_for_new_call(ready_event, bridge);
        port
    }

    /// Return a port to the pool after a call ends. Drains it aggressively
    /// first; if the pool is already at capacity, the port is simply dropped.
    pub fn release(&self, port: Arc<AudioPort>) {
        port.prepare_for_pool();
        let mut idle = self.idle.lock();
        if idle.len() >= MAX_POOL_SIZE {
            debug!("audio port pool at capacity, discarding returned port");
            return;
        }
        idle.push(port);
    }

    /// Number of idle ports currently held.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_recycles_the_same_port() {
        let pool = PortPool::new();
        let port = pool.acquire(Arc::new(Notify::new()), None);
        pool.release(port);
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.acquire(Arc::new(Notify::new()), None);
        assert_eq!(reused.reuse_count(), 1);
    }

    #[test]
    fn pool_caps_idle_size() {
        let pool = PortPool::new();
        for _ in 0..(MAX_POOL_SIZE + 2) {
            let port = pool.acquire(Arc::new(Notify::new()), None);
            pool.release(port);
        }
        assert_eq!(pool.idle_count(), MAX_POOL_SIZE);
    }

    #[test]
    fn port_past_reuse_ceiling_is_replaced() {
        let pool = PortPool::new();
        for _ in 0..=MAX_REUSE_COUNT {
            let port = pool.acquire(Arc::new(Notify::new()), None);
            pool.release(port);
        }
        let fresh = pool.acquire(Arc::new(Notify::new()), None);
        assert_eq!(fresh.reuse_count(), 0);
    }
}
