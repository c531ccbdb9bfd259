use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::task::AbortHandle;

/// A registered connection's two direction tasks, tracked so shutdown can
/// force them down without waiting out a stuck read/write.
pub struct ConnHandle {
    pub ingress: AbortHandle,
    pub egress: AbortHandle,
}

impl ConnHandle {
    fn abort(&self) {
        self.ingress.abort();
        self.egress.abort();
    }
}

/// Tracks live TCP connections for graceful shutdown. One registry per TCP
/// proxy; id generation is `remote_addr:seq`, matching the source's
/// `connMap`.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: DashMap<String, ConnHandle>,
    seq: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self, remote_addr: &str) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{remote_addr}:{n}")
    }

    pub fn insert(&self, id: String, handle: ConnHandle) {
        self.conns.insert(id, handle);
    }

    pub fn remove(&self, id: &str) {
        self.conns.remove(id);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Force-closes every tracked connection by aborting its direction
    /// tasks. Idempotent: connections already removed (finished naturally,
    /// racing shutdown) are silently skipped along with everyone else.
    pub fn close_all(&self) {
        for entry in self.conns.iter() {
            entry.value().abort();
        }
        self.conns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generation_is_monotonic_per_remote() {
        let reg = ConnectionRegistry::new();
        let a = reg.next_id("127.0.0.1:4000");
        let b = reg.next_id("127.0.0.1:4000");
        assert_ne!(a, b);
        assert!(a.starts_with("127.0.0.1:4000:"));
    }

    #[test]
    fn close_all_on_empty_registry_is_a_no_op() {
        let reg = ConnectionRegistry::new();
        reg.close_all();
        assert_eq!(reg.len(), 0);
    }
}
