//! YAML service/rule configuration, the compiler's input (§6). Loading is a
//! pure function handing an owned `Vec` to the caller — no mutable
//! singleton config store.

use std::path::Path;

use serde::Deserialize;

use crate::error::CoreError;

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub descriptor: String,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    pub rule: String,
    #[serde(default)]
    pub verdict: String,
    #[serde(default)]
    pub alert: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

fn default_request_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    pub listen: String,
    pub target: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Tcp,
    Http,
}

impl ServiceKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            ServiceKind::Tcp => "tcp",
            ServiceKind::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RootConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Loads and parses the YAML config at `path`. Pure: returns an owned
/// value, no global state is touched.
pub fn load(path: impl AsRef<Path>) -> Result<RootConfig, CoreError> {
    let text = std::fs::read_to_string(path)?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<RootConfig, CoreError> {
    let cfg: RootConfig = serde_yaml::from_str(text)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_service_and_rule() {
        let yaml = r#"
rules:
  - name: blockfoo
    type: "tcp::contains"
    args: ["foo"]
services:
  - name: svc
    type: "tcp"
    listen: "127.0.0.1:1337"
    target: "127.0.0.1:9000"
    filters:
      - rule: blockfoo
        verdict: "drop"
"#;
        let cfg = parse(yaml).unwrap();
        assert_eq!(cfg.services.len(), 1);
        assert_eq!(cfg.services[0].request_timeout, 5);
        assert_eq!(cfg.rules[0].args, vec!["foo".to_string()]);
    }
}
