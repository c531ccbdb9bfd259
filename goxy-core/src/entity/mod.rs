//! Uniform capability view over traffic units: a raw TCP chunk, an HTTP
//! request, or an HTTP response. Encoded as a sealed variant rather than a
//! trait object so the TCP-only gaps (no headers/cookies/JSON) are a
//! compile-time-checked `EntityError::NotSupported`, not a runtime panic.

use std::collections::BTreeMap;

use crate::value::DynValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    NotSupported,
    ParseError(String),
}

impl std::fmt::Display for EntityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityError::NotSupported => write!(f, "capability not supported for this entity"),
            EntityError::ParseError(s) => write!(f, "parse error: {s}"),
        }
    }
}

impl std::error::Error for EntityError {}

pub type EntityResult<T> = Result<T, EntityError>;

/// A single raw TCP byte chunk observed in one direction of a connection.
#[derive(Debug, Clone)]
pub struct TcpChunk {
    pub data: Vec<u8>,
    pub ingress: bool,
}

/// An HTTP request, captured with its body drained into an owned buffer at
/// construction time so every view (`body`, `json`, `form`) is a pure
/// function of that buffer — no seek-to-zero reader, no repeated I/O.
#[derive(Debug, Clone)]
pub struct HttpRequestEntity {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// An HTTP response, same drain-once-into-owned-buffer treatment.
#[derive(Debug, Clone)]
pub struct HttpResponseEntity {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Entity {
    TcpChunk(TcpChunk),
    HttpRequest(HttpRequestEntity),
    HttpResponse(HttpResponseEntity),
}

impl Entity {
    /// true = client->server for an HTTP request or a TCP ingress chunk;
    /// false = server->client. An HTTP request is always ingress; an HTTP
    /// response is always egress.
    pub fn ingress(&self) -> bool {
        match self {
            Entity::TcpChunk(c) => c.ingress,
            Entity::HttpRequest(_) => true,
            Entity::HttpResponse(_) => false,
        }
    }

    pub fn raw(&self) -> Vec<u8> {
        match self {
            Entity::TcpChunk(c) => c.data.clone(),
            Entity::HttpRequest(r) => {
                let mut out = format!("{} {}{} HTTP/1.1\r\n", r.method, r.path, r.query)
                    .into_bytes();
                for (k, v) in &r.headers {
                    out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
                }
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(&r.body);
                out
            }
            Entity::HttpResponse(r) => {
                let mut out = format!("HTTP/1.1 {}\r\n", r.status).into_bytes();
                for (k, v) in &r.headers {
                    out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
                }
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(&r.body);
                out
            }
        }
    }

    pub fn body(&self) -> EntityResult<Vec<u8>> {
        match self {
            Entity::TcpChunk(c) => Ok(c.data.clone()),
            Entity::HttpRequest(r) => Ok(r.body.clone()),
            Entity::HttpResponse(r) => Ok(r.body.clone()),
        }
    }

    /// Mutates the owned body buffer. The only rewrite path exposed today
    /// (used by the body-obfuscator transform rule).
    pub fn set_body(&mut self, body: Vec<u8>) -> EntityResult<()> {
        match self {
            Entity::TcpChunk(_) => Err(EntityError::NotSupported),
            Entity::HttpRequest(r) => {
                r.body = body;
                Ok(())
            }
            Entity::HttpResponse(r) => {
                r.body = body;
                Ok(())
            }
        }
    }

    pub fn json(&self) -> EntityResult<DynValue> {
        if matches!(self, Entity::TcpChunk(_)) {
            return Err(EntityError::NotSupported);
        }
        let body = self.body()?;
        if body.is_empty() {
            return Err(EntityError::ParseError("empty body".to_string()));
        }
        let v: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| EntityError::ParseError(e.to_string()))?;
        Ok(DynValue::from(v))
    }

    pub fn form(&self) -> EntityResult<BTreeMap<String, Vec<String>>> {
        if matches!(self, Entity::TcpChunk(_)) {
            return Err(EntityError::NotSupported);
        }
        let body = self.body()?;
        let text = String::from_utf8(body).map_err(|e| EntityError::ParseError(e.to_string()))?;
        Ok(parse_www_form(&text))
    }

    pub fn query(&self) -> EntityResult<BTreeMap<String, Vec<String>>> {
        match self {
            Entity::HttpRequest(r) => {
                let q = r.query.strip_prefix('?').unwrap_or(&r.query);
                Ok(parse_www_form(q))
            }
            _ => Err(EntityError::NotSupported),
        }
    }

    pub fn path(&self) -> EntityResult<String> {
        match self {
            Entity::HttpRequest(r) => Ok(r.path.clone()),
            _ => Err(EntityError::NotSupported),
        }
    }

    pub fn headers(&self) -> EntityResult<&[(String, String)]> {
        match self {
            Entity::HttpRequest(r) => Ok(&r.headers),
            Entity::HttpResponse(r) => Ok(&r.headers),
            Entity::TcpChunk(_) => Err(EntityError::NotSupported),
        }
    }

    pub fn cookies(&self) -> EntityResult<Vec<(String, String)>> {
        let headers = self.headers()?;
        let mut out = Vec::new();
        for (k, v) in headers {
            if k.eq_ignore_ascii_case("cookie") {
                for pair in v.split(';') {
                    if let Some((name, value)) = pair.trim().split_once('=') {
                        out.push((name.to_string(), value.to_string()));
                    }
                }
            }
        }
        Ok(out)
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_www_form(s: &str) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if s.is_empty() {
        return out;
    }
    for pair in s.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        out.entry(percent_decode(k))
            .or_default()
            .push(percent_decode(v));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(body: &str) -> Entity {
        Entity::HttpRequest(HttpRequestEntity {
            method: "POST".into(),
            path: "/login".into(),
            query: String::new(),
            headers: vec![("Cookie".into(), "a=1; b=2".into())],
            body: body.as_bytes().to_vec(),
        })
    }

    #[test]
    fn json_is_reparseable() {
        let e = req(r#"{"user":{"role":"Admin"}}"#);
        let first = e.json().unwrap();
        let second = e.json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn request_is_always_ingress() {
        let e = req("{}");
        assert!(e.ingress());
        let resp = Entity::HttpResponse(HttpResponseEntity {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
        });
        assert!(!resp.ingress());
    }

    #[test]
    fn cookies_parse_into_pairs() {
        let e = req("{}");
        let cookies = e.cookies().unwrap();
        assert_eq!(
            cookies,
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn tcp_chunk_rejects_http_only_capabilities() {
        let c = Entity::TcpChunk(TcpChunk {
            data: b"flag{abc}".to_vec(),
            ingress: true,
        });
        assert_eq!(c.json(), Err(EntityError::NotSupported));
        assert_eq!(c.headers(), Err(EntityError::NotSupported));
    }

    #[test]
    fn form_decodes_percent_and_plus() {
        let parsed = parse_www_form("name=John+Doe&tag=a%2Bb");
        assert_eq!(parsed.get("name").unwrap()[0], "John Doe");
        assert_eq!(parsed.get("tag").unwrap()[0], "a+b");
    }
}
