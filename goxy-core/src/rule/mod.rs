//! Tree of predicates evaluated against a Proxy Context and a value: either
//! an `Entity` or an already-projected `DynValue`. See `compiler` for how
//! descriptor strings turn into trees of these nodes.

pub mod compiler;

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::context::ProxyContext;
use crate::entity::{Entity, EntityError};
use crate::error::CoreError;
use crate::value::DynValue;

/// A rule is applied to either a raw `Entity` (before any converter has
/// run) or a `DynValue` projected out of one by a `Convert` node. The
/// `Entity` side is mutable so a transform rule can rewrite the body in
/// place; every other rule only ever reads through the reborrow.
pub enum Input<'a> {
    Entity(&'a mut Entity),
    Value(&'a DynValue),
}

pub type ApplyResult = Result<bool, CoreError>;

/// A compiled rule node. Immutable after compilation; safe to share
/// between connections/requests without locking.
#[derive(Clone)]
pub enum Rule {
    // Leaves
    Ingress,
    Contains { name: String, value: String },
    IContains { name: String, value: String },
    Regex { name: String, pattern: Arc<Regex> },
    CounterGt { key: String, threshold: i64 },

    // Composers
    And(Vec<Arc<Rule>>),
    Not(Arc<Rule>),

    // Wrappers
    Any(Arc<Rule>),
    Field { child: Arc<Rule>, path: Vec<String> },
    Ingressed(Arc<Rule>),
    Egressed(Arc<Rule>),

    // Entity -> DynValue projection
    Convert { child: Arc<Rule>, converter: Converter },

    #[cfg(feature = "volga-transform")]
    TransformVolga { pattern: Arc<Regex> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Converter {
    Json,
    Cookies,
    Query,
    Body,
    Path,
    Form,
    Headers,
    Raw,
}

impl Rule {
    pub fn apply(&self, ctx: &ProxyContext, input: Input<'_>) -> ApplyResult {
        match self {
            Rule::Ingress => match input {
                Input::Entity(e) => Ok(e.ingress()),
                Input::Value(_) => Err(CoreError::InvalidInputType {
                    rule: "ingress".to_string(),
                    detail: "ingress requires an Entity".to_string(),
                }),
            },

            Rule::Ingressed(child) => match input {
                Input::Entity(e) => {
                    if !e.ingress() {
                        Ok(false)
                    } else {
                        child.apply(ctx, Input::Entity(e))
                    }
                }
                Input::Value(_) => Err(CoreError::InvalidInputType {
                    rule: "ingress-wrapper".to_string(),
                    detail: "ingress wrapper requires an Entity".to_string(),
                }),
            },

            Rule::Egressed(child) => match input {
                Input::Entity(e) => {
                    if e.ingress() {
                        Ok(false)
                    } else {
                        child.apply(ctx, Input::Entity(e))
                    }
                }
                Input::Value(_) => Err(CoreError::InvalidInputType {
                    rule: "egress-wrapper".to_string(),
                    detail: "egress wrapper requires an Entity".to_string(),
                }),
            },

            Rule::Contains { name, value } => {
                apply_substring(ctx, input, name, value, false)
            }
            Rule::IContains { name, value } => {
                apply_substring(ctx, input, name, &value.to_lowercase(), true)
            }
            Rule::Regex { name, pattern } => apply_regex(ctx, input, name, pattern),

            Rule::CounterGt { key, threshold } => Ok(ctx.get_counter(key) > *threshold),

            Rule::And(children) => {
                for child in children {
                    let matched = match &mut input {
                        Input::Entity(e) => child.apply(ctx, Input::Entity(&mut **e))?,
                        Input::Value(v) => child.apply(ctx, Input::Value(*v))?,
                    };
                    if !matched {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            Rule::Not(child) => {
                let matched = match &mut input {
                    Input::Entity(e) => child.apply(ctx, Input::Entity(&mut **e))?,
                    Input::Value(v) => child.apply(ctx, Input::Value(v))?,
                };
                Ok(!matched)
            }

            Rule::Any(child) => match input {
                Input::Value(DynValue::Map(m)) => {
                    for v in m.values() {
                        if child.apply(ctx, Input::Value(v))? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Input::Value(DynValue::List(l)) => {
                    for v in l {
                        if child.apply(ctx, Input::Value(v))? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                _ => Err(CoreError::InvalidInputType {
                    rule: "any".to_string(),
                    detail: "any requires a map or list container".to_string(),
                }),
            },

            Rule::Field { child, path } => match input {
                Input::Value(v) => {
                    let mut cur = v;
                    for key in path {
                        match cur {
                            DynValue::Map(m) => match m.get(key) {
                                Some(next) => cur = next,
                                None => return Ok(false),
                            },
                            _ => return Ok(false),
                        }
                    }
                    child.apply(ctx, Input::Value(cur))
                }
                Input::Entity(_) => Err(CoreError::InvalidInputType {
                    rule: "field".to_string(),
                    detail: "field requires a projected value".to_string(),
                }),
            },

            Rule::Convert { child, converter } => match input {
                Input::Entity(e) => {
                    let projected = project(e, *converter);
                    match projected {
                        Ok(v) => child.apply(ctx, Input::Value(&v)),
                        Err(EntityError::NotSupported) => Ok(false),
                        Err(EntityError::ParseError(msg)) => {
                            log::debug!("convert {:?} failed to parse: {}", converter, msg);
                            Ok(false)
                        }
                    }
                }
                Input::Value(_) => Err(CoreError::InvalidInputType {
                    rule: "convert".to_string(),
                    detail: "convert requires an Entity".to_string(),
                }),
            },

            #[cfg(feature = "volga-transform")]
            Rule::TransformVolga { pattern } => match input {
                Input::Entity(e) => {
                    let body = e.body().map_err(|_| CoreError::InvalidInputType {
                        rule: "transform_volga".to_string(),
                        detail: "entity has no body".to_string(),
                    })?;
                    let text = String::from_utf8_lossy(&body).into_owned();
                    let mut matched = false;
                    let mut out = text.clone();
                    for caps in pattern.captures_iter(&text) {
                        if let Some(inner) = caps.get(1) {
                            matched = true;
                            let obfuscated = obfuscate_match(inner.as_str());
                            out = out.replace(inner.as_str(), &obfuscated);
                        }
                    }
                    if matched {
                        e.set_body(out.into_bytes())
                            .map_err(|_| CoreError::InvalidInputType {
                                rule: "transform_volga".to_string(),
                                detail: "entity body is not rewritable".to_string(),
                            })?;
                    }
                    Ok(matched)
                }
                Input::Value(_) => Err(CoreError::InvalidInputType {
                    rule: "transform_volga".to_string(),
                    detail: "transform_volga requires an Entity".to_string(),
                }),
            },
        }
    }

    /// Stable printable form for diagnostics and control-plane listings.
    /// Intentionally not a parseable wire format.
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

fn project(entity: &Entity, converter: Converter) -> Result<DynValue, EntityError> {
    match converter {
        Converter::Json => entity.json(),
        Converter::Cookies => Ok(DynValue::Map(
            entity
                .cookies()?
                .into_iter()
                .map(|(k, v)| (k, DynValue::String(v)))
                .collect(),
        )),
        Converter::Query => Ok(multimap_to_dyn(entity.query()?)),
        Converter::Body => Ok(DynValue::Bytes(entity.body()?)),
        Converter::Path => Ok(DynValue::String(entity.path()?)),
        Converter::Form => Ok(multimap_to_dyn(entity.form()?)),
        Converter::Headers => Ok(multimap_to_dyn(
            entity
                .headers()?
                .iter()
                .cloned()
                .fold(std::collections::BTreeMap::new(), |mut acc, (k, v)| {
                    acc.entry(k).or_insert_with(Vec::new).push(v);
                    acc
                }),
        )),
        Converter::Raw => Ok(DynValue::Bytes(entity.raw())),
    }
}

/// Swaps each consecutive byte pair in `s`, e.g. `"VolgaCTF"` keeps length
/// but garbles the content so a captured flag can't be read off the wire
/// verbatim. A trailing odd byte is left untouched.
#[cfg(feature = "volga-transform")]
fn obfuscate_match(s: &str) -> String {
    let mut bytes = s.as_bytes().to_vec();
    let mut i = 0;
    while i + 1 < bytes.len() {
        bytes.swap(i, i + 1);
        i += 2;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn multimap_to_dyn(m: std::collections::BTreeMap<String, Vec<String>>) -> DynValue {
    DynValue::Map(
        m.into_iter()
            .map(|(k, v)| {
                (
                    k,
                    DynValue::List(v.into_iter().map(DynValue::String).collect()),
                )
            })
            .collect(),
    )
}

/// Counts occurrences of `needle` in the scanned value and accumulates that
/// count into the context counter named `name` before returning whether the
/// count is positive. Accepted input kinds: Entity (reads body), map
/// (counts matching keys), list (element-wise), string, bytes.
fn apply_substring(
    ctx: &ProxyContext,
    input: Input<'_>,
    name: &str,
    needle: &str,
    case_fold: bool,
) -> ApplyResult {
    let count = match input {
        Input::Entity(e) => {
            let body = e.body().map_err(|_| CoreError::InvalidInputType {
                rule: "contains".to_string(),
                detail: "entity has no body".to_string(),
            })?;
            count_in_bytes(&body, needle.as_bytes(), case_fold)
        }
        Input::Value(v) => count_in_value(v, needle, case_fold)?,
    };
    if count > 0 {
        ctx.add_to_counter(name, count);
    }
    Ok(count > 0)
}

fn count_in_bytes(haystack: &[u8], needle: &[u8], case_fold: bool) -> i64 {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    let hay = if case_fold {
        haystack.to_ascii_lowercase()
    } else {
        haystack.to_vec()
    };
    let mut count = 0i64;
    let mut i = 0;
    while i + needle.len() <= hay.len() {
        if &hay[i..i + needle.len()] == needle {
            count += 1;
            i += needle.len();
        } else {
            i += 1;
        }
    }
    count
}

fn count_in_value(value: &DynValue, needle: &str, case_fold: bool) -> Result<i64, CoreError> {
    match value {
        DynValue::String(s) => Ok(count_in_bytes(s.as_bytes(), needle.as_bytes(), case_fold)),
        DynValue::Bytes(b) => Ok(count_in_bytes(b, needle.as_bytes(), case_fold)),
        DynValue::Map(m) => {
            let mut total = 0;
            for k in m.keys() {
                total += count_in_bytes(k.as_bytes(), needle.as_bytes(), case_fold);
            }
            Ok(total)
        }
        DynValue::List(l) => {
            let mut total = 0;
            for v in l {
                total += count_in_value(v, needle, case_fold)?;
            }
            Ok(total)
        }
        _ => Err(CoreError::InvalidInputType {
            rule: "contains".to_string(),
            detail: format!("unsupported value kind for contains: {value:?}"),
        }),
    }
}

fn apply_regex(ctx: &ProxyContext, input: Input<'_>, name: &str, pattern: &Regex) -> ApplyResult {
    let haystack = match input {
        Input::Entity(e) => e.body().map_err(|_| CoreError::InvalidInputType {
            rule: "regex".to_string(),
            detail: "entity has no body".to_string(),
        })?,
        Input::Value(DynValue::String(s)) => s.clone().into_bytes(),
        Input::Value(DynValue::Bytes(b)) => b.clone(),
        Input::Value(v) => {
            return Err(CoreError::InvalidInputType {
                rule: "regex".to_string(),
                detail: format!("unsupported value kind for regex: {v:?}"),
            })
        }
    };
    let text = String::from_utf8_lossy(&haystack);
    let count = pattern.find_iter(&text).count() as i64;
    if count > 0 {
        ctx.add_to_counter(name, count);
    }
    Ok(count > 0)
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Ingress => write!(f, "ingress"),
            Rule::Contains { value, .. } => write!(f, "contains '{value}'"),
            Rule::IContains { value, .. } => write!(f, "icontains '{value}'"),
            Rule::Regex { pattern, .. } => write!(f, "regex '{}'", pattern.as_str()),
            Rule::CounterGt { key, threshold } => write!(f, "counter_gt '{key}' {threshold}"),
            Rule::And(children) => {
                let parts: Vec<String> = children.iter().map(|c| c.to_string()).collect();
                write!(f, "({})", parts.join(" and "))
            }
            Rule::Not(child) => write!(f, "not ({child})"),
            Rule::Any(child) => write!(f, "any ({child})"),
            Rule::Field { child, path } => write!(f, "field '{}' ({child})", path.join(".")),
            Rule::Ingressed(child) => write!(f, "ingress and {child}"),
            Rule::Egressed(child) => write!(f, "egress and {child}"),
            Rule::Convert { child, converter } => write!(f, "{converter:?} ({child})"),
            #[cfg(feature = "volga-transform")]
            Rule::TransformVolga { .. } => write!(f, "transform_volga"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{HttpRequestEntity, TcpChunk};

    fn tcp(data: &[u8], ingress: bool) -> Entity {
        Entity::TcpChunk(TcpChunk {
            data: data.to_vec(),
            ingress,
        })
    }

    #[test]
    fn contains_matches_and_accumulates_counter() {
        let ctx = ProxyContext::new();
        let rule = Rule::Contains {
            name: "blockfoo".to_string(),
            value: "foo".to_string(),
        };
        let mut e = tcp(b"foobar", true);
        assert!(rule.apply(&ctx, Input::Entity(&mut e)).unwrap());
        assert_eq!(ctx.get_counter("blockfoo"), 1);
    }

    #[test]
    fn ingress_wrapper_short_circuits_on_direction() {
        let ctx = ProxyContext::new();
        let inner = Arc::new(Rule::Contains {
            name: "hit".to_string(),
            value: "flag{".to_string(),
        });
        let rule = Rule::Ingressed(inner);
        let mut ingress_chunk = tcp(b"flag{abc}", true);
        let mut egress_chunk = tcp(b"flag{abc}", false);
        assert!(rule.apply(&ctx, Input::Entity(&mut ingress_chunk)).unwrap());
        assert!(!rule.apply(&ctx, Input::Entity(&mut egress_chunk)).unwrap());
    }

    #[test]
    fn counter_gt_gates_on_fourth_increment() {
        let ctx = ProxyContext::new();
        let hit = Rule::Contains {
            name: "gets".to_string(),
            value: "GET".to_string(),
        };
        let many = Rule::CounterGt {
            key: "gets".to_string(),
            threshold: 2,
        };
        for i in 0..4 {
            let mut e = tcp(b"GET /", true);
            let _ = hit.apply(&ctx, Input::Entity(&mut e)).unwrap();
            let dropped = many.apply(&ctx, Input::Entity(&mut e)).unwrap();
            if i < 3 {
                assert!(!dropped, "iteration {i} should not yet be dropped");
            } else {
                assert!(dropped, "fourth iteration should be dropped");
            }
        }
    }

    #[test]
    fn field_walks_nested_map_and_icontains_case_folds() {
        let mut req = Entity::HttpRequest(HttpRequestEntity {
            method: "POST".into(),
            path: "/login".into(),
            query: String::new(),
            headers: Vec::new(),
            body: br#"{"user":{"role":"Admin"}}"#.to_vec(),
        });
        let ctx = ProxyContext::new();
        let leaf = Arc::new(Rule::IContains {
            name: "adminhit".to_string(),
            value: "admin".to_string(),
        });
        let field = Arc::new(Rule::Field {
            child: leaf,
            path: vec!["user".to_string(), "role".to_string()],
        });
        let rule = Rule::Convert {
            child: field,
            converter: Converter::Json,
        };
        assert!(rule.apply(&ctx, Input::Entity(&mut req)).unwrap());
    }

    #[test]
    fn field_missing_path_is_no_match_not_error() {
        let mut req = Entity::HttpRequest(HttpRequestEntity {
            method: "POST".into(),
            path: "/login".into(),
            query: String::new(),
            headers: Vec::new(),
            body: br#"{"user":{"name":"bob"}}"#.to_vec(),
        });
        let ctx = ProxyContext::new();
        let leaf = Arc::new(Rule::IContains {
            name: "adminhit".to_string(),
            value: "admin".to_string(),
        });
        let field = Arc::new(Rule::Field {
            child: leaf,
            path: vec!["user".to_string(), "role".to_string()],
        });
        let rule = Rule::Convert {
            child: field,
            converter: Converter::Json,
        };
        assert!(!rule.apply(&ctx, Input::Entity(&mut req)).unwrap());
    }

    #[test]
    fn and_short_circuits_left_to_right() {
        let ctx = ProxyContext::new();
        let yes = Arc::new(Rule::Contains {
            name: "a".to_string(),
            value: "GET".to_string(),
        });
        let no = Arc::new(Rule::Contains {
            name: "b".to_string(),
            value: "POST".to_string(),
        });
        let and_rule = Rule::And(vec![no, yes]);
        let mut e = tcp(b"GET /", true);
        assert!(!and_rule.apply(&ctx, Input::Entity(&mut e)).unwrap());
        assert_eq!(ctx.get_counter("a"), 0, "short-circuit must skip later children");
    }

    #[test]
    #[cfg(feature = "volga-transform")]
    fn transform_volga_obfuscates_flag_and_reports_match() {
        let ctx = ProxyContext::new();
        let pattern = Arc::new(Regex::new(r"VolgaCTF\{([^}]+)\}").unwrap());
        let rule = Rule::TransformVolga { pattern };
        let mut req = Entity::HttpRequest(HttpRequestEntity {
            method: "GET".into(),
            path: "/".into(),
            query: String::new(),
            headers: Vec::new(),
            body: b"here is VolgaCTF{abcd} for you".to_vec(),
        });
        assert!(rule.apply(&ctx, Input::Entity(&mut req)).unwrap());
        let body = req.body().unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("VolgaCTF{abcd}"));
        assert!(text.contains("VolgaCTF{badc}"));
    }

    #[test]
    #[cfg(feature = "volga-transform")]
    fn transform_volga_is_a_no_op_without_a_match() {
        let ctx = ProxyContext::new();
        let pattern = Arc::new(Regex::new(r"VolgaCTF\{([^}]+)\}").unwrap());
        let rule = Rule::TransformVolga { pattern };
        let mut req = Entity::HttpRequest(HttpRequestEntity {
            method: "GET".into(),
            path: "/".into(),
            query: String::new(),
            headers: Vec::new(),
            body: b"nothing to see here".to_vec(),
        });
        assert!(!rule.apply(&ctx, Input::Entity(&mut req)).unwrap());
    }
}
