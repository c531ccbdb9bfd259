//! Turns declarative descriptor strings (e.g.
//! `http::ingress::json::field::icontains`) into a named dictionary of
//! compiled `Rule` trees, queryable by name. Compilation proceeds
//! right-to-left, per token.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::config::RuleConfig;
use crate::error::CoreError;
use crate::rule::{Converter, Rule};

/// A compiled rule dictionary, immutable once built and handed to proxies.
/// Not a process-wide mutable singleton — one instance per `Manager`.
#[derive(Default)]
pub struct RuleSet {
    rules: HashMap<String, Arc<Rule>>,
}

impl RuleSet {
    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.get(name).cloned()
    }
}

/// Compiles every `RuleConfig` whose descriptor's scheme matches `scheme`
/// ("tcp" or "http") into a `RuleSet`. Descriptors are compiled in the
/// order rule entries appear in config; forward references to an
/// as-yet-uncompiled name are `UnknownRule`.
pub fn compile(configs: &[RuleConfig], scheme: &str) -> Result<RuleSet, CoreError> {
    let mut set = RuleSet::default();
    // `ingress`/`egress` are always resolvable without explicit declaration.
    set.rules.insert("ingress".to_string(), Arc::new(Rule::Ingress));
    set.rules.insert(
        "egress".to_string(),
        Arc::new(Rule::Not(Arc::new(Rule::Ingress))),
    );

    for cfg in configs {
        let tokens: Vec<&str> = cfg.descriptor.split("::").collect();
        if tokens.len() < 2 {
            return Err(CoreError::InvalidConfig(format!(
                "descriptor '{}' needs at least a scheme and a head token",
                cfg.descriptor
            )));
        }
        if tokens[0] != scheme {
            // Rules whose scheme doesn't match this proxy kind are skipped.
            continue;
        }
        let compiled = compile_one(cfg, &tokens[1..], &set)?;
        set.rules.insert(cfg.name.clone(), compiled);
    }
    Ok(set)
}

fn is_converter_token(tok: &str) -> bool {
    matches!(
        tok,
        "json" | "cookies" | "query" | "body" | "path" | "form" | "headers" | "raw"
    )
}

/// Validates token placement ahead of the right-to-left build: at most one
/// converter (already rejected below during the fold, checked again here
/// up front so the position checks have a single converter index to work
/// against), `field` only valid with a converter present and nested inside
/// it, and any raw-entity wrapper (`ingress`/`egress`) kept outside it.
fn validate_token_positions(cfg: &RuleConfig, middle: &[&str]) -> Result<(), CoreError> {
    let mut converter_idx = None;
    let mut field_idx = None;
    let mut last_raw_wrapper_idx = None;

    for (i, tok) in middle.iter().enumerate() {
        if is_converter_token(tok) {
            if converter_idx.is_some() {
                return Err(CoreError::InvalidConfig(format!(
                    "rule '{}': descriptor specifies more than one converter",
                    cfg.name
                )));
            }
            converter_idx = Some(i);
        } else if *tok == "field" {
            field_idx = Some(i);
        } else if *tok == "ingress" || *tok == "egress" {
            last_raw_wrapper_idx = Some(i);
        }
    }

    if let Some(fi) = field_idx {
        let ci = converter_idx.ok_or_else(|| {
            CoreError::InvalidConfig(format!(
                "rule '{}': field wrapper requires a conversion token earlier in the descriptor",
                cfg.name
            ))
        })?;
        if fi <= ci {
            return Err(CoreError::InvalidConfig(format!(
                "rule '{}': field wrapper must sit between the conversion token and the head",
                cfg.name
            )));
        }
        if let Some(ri) = last_raw_wrapper_idx {
            if ri >= ci {
                return Err(CoreError::InvalidConfig(format!(
                    "rule '{}': field wrapper must sit between the last raw-wrapper token and the conversion token",
                    cfg.name
                )));
            }
        }
    }

    Ok(())
}

fn compile_one(
    cfg: &RuleConfig,
    rest: &[&str],
    set: &RuleSet,
) -> Result<Arc<Rule>, CoreError> {
    let (middle, head) = rest.split_at(rest.len() - 1);
    let head = head[0];

    validate_token_positions(cfg, middle)?;

    let mut node = build_head(cfg, head, set)?;

    let mut converter_seen = false;
    for token in middle.iter().rev() {
        node = match *token {
            "field" => {
                if cfg.field.is_empty() {
                    return Err(CoreError::InvalidConfig(format!(
                        "rule '{}': field wrapper requires a non-empty field path",
                        cfg.name
                    )));
                }
                Arc::new(Rule::Field {
                    child: node,
                    path: cfg.field.split('.').map(str::to_string).collect(),
                })
            }
            "any" => Arc::new(Rule::Any(node)),
            "not" => Arc::new(Rule::Not(node)),
            "ingress" => Arc::new(Rule::Ingressed(node)),
            "egress" => Arc::new(Rule::Egressed(node)),
            converter_tok if is_converter_token(converter_tok) => {
                converter_seen = true;
                Arc::new(Rule::Convert {
                    child: node,
                    converter: converter_from_token(converter_tok),
                })
            }
            other => {
                return Err(CoreError::InvalidConfig(format!(
                    "rule '{}': unknown wrapper/converter token '{}'",
                    cfg.name, other
                )))
            }
        };
    }

    // No converter appeared, but the built tree's root only accepts a
    // projected Value (field/any) rather than a raw Entity: insert an
    // implicit raw converter so it can still be driven from the outside.
    if !converter_seen && matches!(*node, Rule::Field { .. } | Rule::Any(_)) {
        node = Arc::new(Rule::Convert {
            child: node,
            converter: Converter::Raw,
        });
    }

    Ok(node)
}

fn converter_from_token(tok: &str) -> Converter {
    match tok {
        "json" => Converter::Json,
        "cookies" => Converter::Cookies,
        "query" => Converter::Query,
        "body" => Converter::Body,
        "path" => Converter::Path,
        "form" => Converter::Form,
        "headers" => Converter::Headers,
        "raw" => Converter::Raw,
        _ => unreachable!("converter_from_token called with non-converter token"),
    }
}

fn build_head(cfg: &RuleConfig, head: &str, set: &RuleSet) -> Result<Arc<Rule>, CoreError> {
    match head {
        "and" => {
            if cfg.args.len() < 2 {
                return Err(CoreError::InvalidConfig(format!(
                    "rule '{}': 'and' requires at least 2 args",
                    cfg.name
                )));
            }
            let children = resolve_refs(cfg, set)?;
            Ok(Arc::new(Rule::And(children)))
        }
        "not" => {
            if cfg.args.len() != 1 {
                return Err(CoreError::InvalidConfig(format!(
                    "rule '{}': 'not' requires exactly 1 arg",
                    cfg.name
                )));
            }
            let mut children = resolve_refs(cfg, set)?;
            Ok(Arc::new(Rule::Not(children.remove(0))))
        }
        "contains" => {
            let value = single_arg(cfg, "contains")?;
            Ok(Arc::new(Rule::Contains {
                name: cfg.name.clone(),
                value,
            }))
        }
        "icontains" => {
            let value = single_arg(cfg, "icontains")?;
            Ok(Arc::new(Rule::IContains {
                name: cfg.name.clone(),
                value,
            }))
        }
        "regex" => {
            let pattern = single_arg(cfg, "regex")?;
            let compiled = Regex::new(&pattern)?;
            Ok(Arc::new(Rule::Regex {
                name: cfg.name.clone(),
                pattern: Arc::new(compiled),
            }))
        }
        "counter_gt" => {
            if cfg.args.len() != 2 {
                return Err(CoreError::InvalidConfig(format!(
                    "rule '{}': 'counter_gt' requires exactly 2 args",
                    cfg.name
                )));
            }
            let key = cfg.args[0].clone();
            let threshold: i64 = cfg.args[1].parse().map_err(|_| {
                CoreError::InvalidConfig(format!(
                    "rule '{}': counter_gt threshold must be an integer",
                    cfg.name
                ))
            })?;
            Ok(Arc::new(Rule::CounterGt { key, threshold }))
        }
        "ingress" => Ok(Arc::new(Rule::Ingress)),
        #[cfg(feature = "volga-transform")]
        "transform_volga" => {
            let pattern = Regex::new(r"VolgaCTF\{([^}]+)\}")?;
            Ok(Arc::new(Rule::TransformVolga {
                pattern: Arc::new(pattern),
            }))
        }
        other => Err(CoreError::InvalidConfig(format!(
            "rule '{}': unknown head token '{}'",
            cfg.name, other
        ))),
    }
}

fn single_arg(cfg: &RuleConfig, head: &str) -> Result<String, CoreError> {
    if cfg.args.len() != 1 {
        return Err(CoreError::InvalidConfig(format!(
            "rule '{}': '{}' requires exactly 1 arg",
            cfg.name, head
        )));
    }
    Ok(cfg.args[0].clone())
}

fn resolve_refs(cfg: &RuleConfig, set: &RuleSet) -> Result<Vec<Arc<Rule>>, CoreError> {
    cfg.args
        .iter()
        .map(|name| {
            set.get(name)
                .ok_or_else(|| CoreError::UnknownRule(name.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProxyContext;
    use crate::entity::{Entity, TcpChunk};
    use crate::rule::Input;

    fn cfg(name: &str, descriptor: &str, field: &str, args: &[&str]) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            field: field.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn compiles_tcp_ingress_contains_and_discriminates_direction() {
        let configs = vec![cfg("blockfoo", "tcp::ingress::contains", "", &["foo{"])];
        let set = compile(&configs, "tcp").unwrap();
        let rule = set.get("blockfoo").unwrap();
        let ctx = ProxyContext::new();
        let mut ingress = Entity::TcpChunk(TcpChunk {
            data: b"foo{abc}".to_vec(),
            ingress: true,
        });
        let mut egress = Entity::TcpChunk(TcpChunk {
            data: b"foo{abc}".to_vec(),
            ingress: false,
        });
        assert!(rule.apply(&ctx, Input::Entity(&mut ingress)).unwrap());
        assert!(!rule.apply(&ctx, Input::Entity(&mut egress)).unwrap());
    }

    #[test]
    fn http_scheme_rule_is_skipped_for_tcp_compile() {
        let configs = vec![cfg("adminpath", "http::ingress::json::icontains", "", &["admin"])];
        let set = compile(&configs, "tcp").unwrap();
        assert!(set.get("adminpath").is_none());
    }

    #[test]
    fn and_composer_resolves_named_references_in_order() {
        let configs = vec![
            cfg("a", "tcp::contains", "", &["GET"]),
            cfg("b", "tcp::contains", "", &["HTTP"]),
            cfg("both", "tcp::and", "", &["a", "b"]),
        ];
        let set = compile(&configs, "tcp").unwrap();
        let rule = set.get("both").unwrap();
        let ctx = ProxyContext::new();
        let mut e = Entity::TcpChunk(TcpChunk {
            data: b"GET / HTTP/1.1".to_vec(),
            ingress: true,
        });
        assert!(rule.apply(&ctx, Input::Entity(&mut e)).unwrap());
    }

    #[test]
    fn forward_reference_is_unknown_rule() {
        let configs = vec![cfg("both", "tcp::and", "", &["later", "also-later"])];
        let err = compile(&configs, "tcp").unwrap_err();
        assert!(matches!(err, CoreError::UnknownRule(_)));
    }

    #[test]
    fn counter_gt_descriptor_and_arity() {
        let configs = vec![cfg("many", "tcp::counter_gt", "", &["gets", "2"])];
        let set = compile(&configs, "tcp").unwrap();
        let rule = set.get("many").unwrap();
        let ctx = ProxyContext::new();
        ctx.add_to_counter("gets", 3);
        let mut e = Entity::TcpChunk(TcpChunk {
            data: Vec::new(),
            ingress: true,
        });
        assert!(rule.apply(&ctx, Input::Entity(&mut e)).unwrap());
    }

    #[test]
    fn two_converters_is_an_error() {
        let configs = vec![cfg("bad", "http::json::query::icontains", "", &["admin"])];
        let err = compile(&configs, "http").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn http_field_json_icontains_matches_nested_field() {
        use crate::entity::HttpRequestEntity;
        let configs = vec![cfg(
            "adminpath",
            "http::ingress::json::field::icontains",
            "user.name",
            &["admin"],
        )];
        let set = compile(&configs, "http").unwrap();
        let rule = set.get("adminpath").unwrap();
        let ctx = ProxyContext::new();
        let mut matching = Entity::HttpRequest(HttpRequestEntity {
            method: "POST".into(),
            path: "/".into(),
            query: String::new(),
            headers: Vec::new(),
            body: br#"{"user":{"name":"ADMIN"}}"#.to_vec(),
        });
        let mut non_matching = Entity::HttpRequest(HttpRequestEntity {
            method: "POST".into(),
            path: "/".into(),
            query: String::new(),
            headers: Vec::new(),
            body: br#"{"user":{"name":"bob"}}"#.to_vec(),
        });
        assert!(rule.apply(&ctx, Input::Entity(&mut matching)).unwrap());
        assert!(!rule.apply(&ctx, Input::Entity(&mut non_matching)).unwrap());
    }

    #[test]
    fn field_before_converter_is_rejected_at_compile_time() {
        let configs = vec![cfg(
            "bad",
            "http::field::json::icontains",
            "user.name",
            &["admin"],
        )];
        let err = compile(&configs, "http").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn field_without_any_converter_is_rejected_at_compile_time() {
        let configs = vec![cfg("bad", "http::field::icontains", "user.name", &["admin"])];
        let err = compile(&configs, "http").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn raw_wrapper_after_converter_is_rejected_at_compile_time() {
        let configs = vec![cfg(
            "bad",
            "http::json::ingress::field::icontains",
            "user.name",
            &["admin"],
        )];
        let err = compile(&configs, "http").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }

    #[test]
    fn any_without_converter_gets_an_implicit_raw_wrap() {
        let configs = vec![cfg("bad", "tcp::any::contains", "", &["foo"])];
        let set = compile(&configs, "tcp").unwrap();
        let rule = set.get("bad").unwrap();
        assert!(rule.to_string().starts_with("Raw ("));
    }
}
