pub mod http;
pub mod stream;
pub mod tcp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ServiceConfig;
use crate::error::CoreError;
use crate::filter::Filter;

/// Lifecycle states common to both proxy kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    New,
    Listening,
    Closing,
    Closed,
}

/// A single filter's control-plane-facing description.
pub struct FilterDescription {
    pub id: usize,
    pub rule: String,
    pub verdict: String,
    pub enabled: bool,
    pub alert: bool,
}

/// Common interface the Manager drives both TCP and HTTP proxies through.
#[async_trait]
pub trait Proxy: Send + Sync {
    async fn start(&self) -> Result<(), CoreError>;
    async fn shutdown(&self, deadline: std::time::Duration) -> Result<(), CoreError>;
    fn set_listening(&self, listening: bool);
    fn get_listening(&self) -> bool;
    fn set_filter_state(&self, filter_id: usize, enabled: bool, alert: bool) -> Result<(), CoreError>;
    fn get_filters(&self) -> Vec<FilterDescription>;
    fn get_config(&self) -> &ServiceConfig;
}

/// Shared atomic listening flag, used by both proxy kinds' accept loops.
pub(crate) struct ListeningFlag(AtomicBool);

impl ListeningFlag {
    pub(crate) fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub(crate) fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self, v: bool) {
        self.0.store(v, Ordering::SeqCst);
    }
}

pub(crate) fn filter_descriptions(filters: &[Filter]) -> Vec<FilterDescription> {
    filters
        .iter()
        .enumerate()
        .map(|(idx, f)| FilterDescription {
            id: idx + 1,
            rule: f.rule.to_string(),
            verdict: f.verdict.to_string(),
            enabled: f.is_enabled(),
            alert: f.alerts(),
        })
        .collect()
}

pub(crate) fn apply_filter_state(
    filters: &[Filter],
    filter_id: usize,
    enabled: bool,
    alert: bool,
) -> Result<(), CoreError> {
    if filter_id == 0 || filter_id > filters.len() {
        return Err(CoreError::InvalidFilter {
            proxy_id: 0,
            filter_id,
        });
    }
    let filter = &filters[filter_id - 1];
    filter.set_enabled(enabled);
    filter.set_alert(alert);
    Ok(())
}

/// Splits `addr:port` defensively; the source guards against addresses
/// that fail to parse cleanly (e.g. IPv6 literals without brackets).
pub(crate) fn split_addr_safe(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (
            host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port.parse().unwrap_or(0),
        ),
        None => (addr.to_string(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_addr_safe_handles_plain_and_bracketed() {
        assert_eq!(split_addr_safe("127.0.0.1:8080"), ("127.0.0.1".to_string(), 8080));
        assert_eq!(split_addr_safe("[::1]:8080"), ("::1".to_string(), 8080));
        assert_eq!(split_addr_safe("garbage"), ("garbage".to_string(), 0));
    }
}
