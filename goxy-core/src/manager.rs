//! Owns every configured proxy and is the sole entry point the control
//! plane (`goxy-api`) and `main.rs` drive. Builds the rule/filter set for
//! each service from a `RootConfig`, then exposes lifecycle and
//! introspection operations over the resulting fleet.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{RootConfig, ServiceConfig, ServiceKind};
use crate::error::CoreError;
use crate::export::Exporter;
use crate::filter::Filter;
use crate::proxy::http::HttpProxy;
use crate::proxy::tcp::TcpProxy;
use crate::proxy::{FilterDescription, Proxy};
use crate::rule::compiler;
use crate::verdict::Verdict;

/// Control-plane read model for one proxy, 1-based `id` matching the
/// position it's addressed by in `set_proxy_listening`/`set_filter_state`.
pub struct ProxyDescription {
    pub id: usize,
    pub name: String,
    pub scheme: String,
    pub listen: String,
    pub target: String,
    pub listening: bool,
    pub filters: Vec<FilterDescription>,
}

pub struct Manager {
    proxies: Vec<Arc<dyn Proxy>>,
}

impl Manager {
    /// Compiles every service's rule set and filter chain and constructs
    /// its proxy, but does not start listening — call `start_all` for that.
    pub fn new(config: &RootConfig, exporter: Arc<dyn Exporter>) -> Result<Self, CoreError> {
        let mut proxies: Vec<Arc<dyn Proxy>> = Vec::with_capacity(config.services.len());

        for svc in &config.services {
            let scheme = svc.kind.scheme();
            let ruleset = compiler::compile(&config.rules, scheme)?;

            let mut filters = Vec::with_capacity(svc.filters.len());
            for fc in &svc.filters {
                let rule = ruleset
                    .get(&fc.rule)
                    .ok_or_else(|| CoreError::UnknownRule(fc.rule.clone()))?;
                let verdict = Verdict::parse(&fc.verdict)?;
                filters.push(Filter::new(fc.rule.clone(), rule, verdict, fc.alert));
            }

            let proxy: Arc<dyn Proxy> = match svc.kind {
                ServiceKind::Tcp => Arc::new(TcpProxy::new(svc.clone(), filters, exporter.clone())),
                ServiceKind::Http => {
                    Arc::new(HttpProxy::new(svc.clone(), filters, exporter.clone())?)
                }
            };
            proxies.push(proxy);
        }

        Ok(Manager { proxies })
    }

    /// Starts every proxy in configuration order. If one fails to bind,
    /// every proxy started before it is rolled back before the error is
    /// returned, the whole rollback bounded by one shared 5 second budget
    /// rather than 5 seconds per already-started proxy.
    pub async fn start_all(&self) -> Result<(), CoreError> {
        for (idx, proxy) in self.proxies.iter().enumerate() {
            if let Err(e) = proxy.start().await {
                log::error!(
                    "proxy '{}' failed to start: {}, rolling back {} already-started",
                    proxy.get_config().name,
                    e,
                    idx
                );
                let rollback_deadline = Instant::now() + Duration::from_secs(5);
                for started in &self.proxies[..idx] {
                    let remaining = rollback_deadline.saturating_duration_since(Instant::now());
                    if let Err(rollback_err) = started.shutdown(remaining).await {
                        log::error!(
                            "rollback shutdown of '{}' failed: {}",
                            started.get_config().name,
                            rollback_err
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Shuts down every proxy concurrently, each bounded by `deadline`.
    /// Returns the first error encountered, if any, after every proxy has
    /// finished or timed out.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), CoreError> {
        let mut set = tokio::task::JoinSet::new();
        for proxy in &self.proxies {
            let proxy = proxy.clone();
            set.spawn(async move { proxy.shutdown(deadline).await });
        }

        let mut first_err = None;
        while let Some(res) = set.join_next().await {
            let outcome = match res {
                Ok(inner) => inner,
                Err(join_err) => Err(CoreError::InvalidConfig(join_err.to_string())),
            };
            if let Err(e) = outcome {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn dump_proxies(&self) -> Vec<ProxyDescription> {
        self.proxies
            .iter()
            .enumerate()
            .map(|(idx, proxy)| {
                let config = proxy.get_config();
                ProxyDescription {
                    id: idx + 1,
                    name: config.name.clone(),
                    scheme: scheme_of(config).to_string(),
                    listen: config.listen.clone(),
                    target: config.target.clone(),
                    listening: proxy.get_listening(),
                    filters: proxy.get_filters(),
                }
            })
            .collect()
    }

    pub fn set_proxy_listening(&self, proxy_id: usize, listening: bool) -> Result<(), CoreError> {
        let proxy = self.proxy_at(proxy_id)?;
        proxy.set_listening(listening);
        Ok(())
    }

    pub fn set_filter_state(
        &self,
        proxy_id: usize,
        filter_id: usize,
        enabled: bool,
        alert: bool,
    ) -> Result<(), CoreError> {
        let proxy = self.proxy_at(proxy_id)?;
        proxy
            .set_filter_state(filter_id, enabled, alert)
            .map_err(|e| match e {
                CoreError::InvalidFilter { filter_id, .. } => CoreError::InvalidFilter {
                    proxy_id,
                    filter_id,
                },
                other => other,
            })
    }

    fn proxy_at(&self, proxy_id: usize) -> Result<&Arc<dyn Proxy>, CoreError> {
        if proxy_id == 0 || proxy_id > self.proxies.len() {
            return Err(CoreError::NoSuchProxy(proxy_id));
        }
        Ok(&self.proxies[proxy_id - 1])
    }
}

fn scheme_of(config: &ServiceConfig) -> &'static str {
    config.kind.scheme()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterConfig, RuleConfig};
    use crate::export::NoopExporter;

    fn sample_config() -> RootConfig {
        RootConfig {
            rules: vec![RuleConfig {
                name: "blockfoo".to_string(),
                descriptor: "tcp::contains".to_string(),
                field: String::new(),
                args: vec!["foo".to_string()],
            }],
            services: vec![ServiceConfig {
                name: "svc-a".to_string(),
                kind: ServiceKind::Tcp,
                listen: "127.0.0.1:0".to_string(),
                target: "127.0.0.1:1".to_string(),
                request_timeout: 5,
                tls: None,
                filters: vec![FilterConfig {
                    rule: "blockfoo".to_string(),
                    verdict: "drop".to_string(),
                    alert: false,
                }],
            }],
        }
    }

    #[test]
    fn builds_one_proxy_per_service() {
        let manager = Manager::new(&sample_config(), Arc::new(NoopExporter)).unwrap();
        let dump = manager.dump_proxies();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].id, 1);
        assert_eq!(dump[0].filters.len(), 1);
    }

    #[test]
    fn unknown_filter_rule_reference_is_an_error() {
        let mut config = sample_config();
        config.services[0].filters[0].rule = "missing".to_string();
        let err = Manager::new(&config, Arc::new(NoopExporter)).unwrap_err();
        assert!(matches!(err, CoreError::UnknownRule(_)));
    }

    #[test]
    fn out_of_range_proxy_id_is_rejected() {
        let manager = Manager::new(&sample_config(), Arc::new(NoopExporter)).unwrap();
        let err = manager.set_proxy_listening(0, true).unwrap_err();
        assert!(matches!(err, CoreError::NoSuchProxy(0)));
        let err = manager.set_proxy_listening(2, true).unwrap_err();
        assert!(matches!(err, CoreError::NoSuchProxy(2)));
    }

    #[tokio::test]
    async fn start_all_then_shutdown_round_trips_on_loopback() {
        let manager = Manager::new(&sample_config(), Arc::new(NoopExporter)).unwrap();
        manager.start_all().await.unwrap();
        manager.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
