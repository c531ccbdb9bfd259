use dashmap::DashMap;

/// Well-known flag that terminates filter-chain evaluation and causes the
/// proxy to reject the flow.
pub const FLAG_DROP: &str = "drop";
/// Well-known flag that terminates filter-chain evaluation and causes the
/// proxy to forward the flow immediately without running later filters.
pub const FLAG_ACCEPT: &str = "accept";

/// Per-connection / per-request mutable scratchpad.
///
/// Shared between the two direction tasks of a single TCP connection, or
/// held across the request and response halves of a single HTTP
/// transaction. All operations are safe to call from any task
/// concurrently; counter arithmetic is linearizable per key.
#[derive(Debug, Default)]
pub struct ProxyContext {
    counters: DashMap<String, i64>,
    flags: DashMap<String, bool>,
}

impl ProxyContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` to the named counter, creating it at 0 if unset.
    pub fn add_to_counter(&self, key: &str, n: i64) -> i64 {
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry += n;
        *entry
    }

    /// Unset counters read as 0.
    pub fn get_counter(&self, key: &str) -> i64 {
        self.counters.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Monotonic: once set, a flag stays set for the context's lifetime.
    pub fn set_flag(&self, key: &str) {
        self.flags.insert(key.to_string(), true);
    }

    /// Unset flags read as false.
    pub fn get_flag(&self, key: &str) -> bool {
        self.flags.get(key).map(|v| *v).unwrap_or(false)
    }

    pub fn is_dropped(&self) -> bool {
        self.get_flag(FLAG_DROP)
    }

    pub fn is_accepted(&self) -> bool {
        self.get_flag(FLAG_ACCEPT)
    }

    /// True once either well-known terminal flag is set; the filter-chain
    /// loop checks this after every verdict.
    pub fn should_short_circuit(&self) -> bool {
        self.is_dropped() || self.is_accepted()
    }

    /// Name->value snapshot of all counters and all truthy flags, used as
    /// structured log fields when an Alert verdict fires. Need not be
    /// atomic across the two maps.
    pub fn dump_fields(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(self.counters.len() + self.flags.len());
        for entry in self.counters.iter() {
            out.push((entry.key().clone(), entry.value().to_string()));
        }
        for entry in self.flags.iter() {
            if *entry.value() {
                out.push((entry.key().clone(), "true".to_string()));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unset_reads_are_zero_and_false() {
        let ctx = ProxyContext::new();
        assert_eq!(ctx.get_counter("hits"), 0);
        assert!(!ctx.get_flag("seen"));
    }

    #[test]
    fn set_flag_is_monotonic() {
        let ctx = ProxyContext::new();
        ctx.set_flag("drop");
        ctx.add_to_counter("hits", 1);
        assert!(ctx.get_flag("drop"));
    }

    #[test]
    fn concurrent_increments_sum_exactly() {
        let ctx = Arc::new(ProxyContext::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctx = ctx.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    ctx.add_to_counter("gets", 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ctx.get_counter("gets"), 8000);
    }

    #[test]
    fn short_circuit_reflects_either_terminal_flag() {
        let ctx = ProxyContext::new();
        assert!(!ctx.should_short_circuit());
        ctx.set_flag(FLAG_ACCEPT);
        assert!(ctx.should_short_circuit());
    }
}
