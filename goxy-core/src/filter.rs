use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::ProxyContext;
use crate::entity::Entity;
use crate::error::CoreError;
use crate::rule::{Input, Rule};
use crate::verdict::Verdict;

/// A rule paired with a verdict and runtime-mutable toggles. A disabled
/// filter is skipped as if absent; toggles are atomic so the control plane
/// can flip them without synchronising with in-flight filter-chain runs.
pub struct Filter {
    pub rule_name: String,
    pub rule: Arc<Rule>,
    pub verdict: Verdict,
    enabled: AtomicBool,
    alert: AtomicBool,
}

impl Filter {
    pub fn new(rule_name: String, rule: Arc<Rule>, verdict: Verdict, alert_default: bool) -> Self {
        Self {
            rule_name,
            rule,
            verdict,
            enabled: AtomicBool::new(true),
            alert: AtomicBool::new(alert_default),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn alerts(&self) -> bool {
        self.alert.load(Ordering::Relaxed)
    }

    pub fn set_alert(&self, alert: bool) {
        self.alert.store(alert, Ordering::Relaxed);
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if {}: {}", self.rule, self.verdict)
    }
}

/// Outcome of running a filter chain against one Entity.
pub enum ChainOutcome {
    Forwarded,
    Dropped,
}

/// Runs every enabled filter in registration order against `entity`,
/// mutating `ctx` as verdicts fire. Short-circuits once `drop`/`accept`
/// becomes set on the context.
pub fn run_chain(
    filters: &[Filter],
    ctx: &ProxyContext,
    entity: &mut Entity,
) -> Result<ChainOutcome, CoreError> {
    for filter in filters {
        if !filter.is_enabled() {
            continue;
        }
        let matched = filter.rule.apply(ctx, Input::Entity(entity))?;
        if matched {
            if filter.alerts() {
                log::warn!(
                    "filter matched: rule='{}' verdict='{}'",
                    filter.rule_name,
                    filter.verdict
                );
            }
            filter.verdict.mutate(ctx);
        }
        if ctx.should_short_circuit() {
            break;
        }
    }
    if ctx.is_dropped() {
        Ok(ChainOutcome::Dropped)
    } else {
        Ok(ChainOutcome::Forwarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::TcpChunk;

    #[test]
    fn disabled_filter_never_invokes_rule_or_verdict() {
        let rule = Arc::new(Rule::Contains {
            name: "hits".to_string(),
            value: "foo".to_string(),
        });
        let filter = Filter::new(
            "blockfoo".to_string(),
            rule,
            Verdict::parse("drop").unwrap(),
            false,
        );
        filter.set_enabled(false);
        let ctx = ProxyContext::new();
        let mut e = Entity::TcpChunk(TcpChunk {
            data: b"foobar".to_vec(),
            ingress: true,
        });
        let outcome = run_chain(std::slice::from_ref(&filter), &ctx, &mut e).unwrap();
        assert!(matches!(outcome, ChainOutcome::Forwarded));
        assert_eq!(ctx.get_counter("hits"), 0);
    }

    #[test]
    fn drop_short_circuits_remaining_filters() {
        let blockfoo = Filter::new(
            "blockfoo".to_string(),
            Arc::new(Rule::Contains {
                name: "hits".to_string(),
                value: "foo".to_string(),
            }),
            Verdict::parse("drop").unwrap(),
            false,
        );
        let never = Filter::new(
            "never".to_string(),
            Arc::new(Rule::Contains {
                name: "never_hits".to_string(),
                value: "foo".to_string(),
            }),
            Verdict::parse("inc::never_hits").unwrap(),
            false,
        );
        let ctx = ProxyContext::new();
        let mut e = Entity::TcpChunk(TcpChunk {
            data: b"foobar".to_vec(),
            ingress: true,
        });
        let outcome = run_chain(&[blockfoo, never], &ctx, &mut e).unwrap();
        assert!(matches!(outcome, ChainOutcome::Dropped));
        assert_eq!(ctx.get_counter("never_hits"), 0);
    }

    #[test]
    fn display_matches_reference_form() {
        let filter = Filter::new(
            "blockfoo".to_string(),
            Arc::new(Rule::Contains {
                name: "hits".to_string(),
                value: "foo".to_string(),
            }),
            Verdict::parse("drop").unwrap(),
            false,
        );
        assert_eq!(filter.to_string(), "if contains 'foo': set 'drop'");
    }
}
