use std::collections::BTreeMap;

/// Tagged variant standing in for the dynamic values produced by entity
/// converters, replacing the runtime type switches over `interface{}` the
/// source relies on.
#[derive(Debug, Clone, PartialEq)]
pub enum DynValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<DynValue>),
    Map(BTreeMap<String, DynValue>),
}

impl DynValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, DynValue>> {
        match self {
            DynValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DynValue]> {
        match self {
            DynValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Renders a value to bytes the way `contains`/`regex` expect to scan
    /// a scalar: strings and bytes pass through, everything else renders
    /// via `Display`-like formatting.
    pub fn to_scan_bytes(&self) -> Vec<u8> {
        match self {
            DynValue::String(s) => s.as_bytes().to_vec(),
            DynValue::Bytes(b) => b.clone(),
            DynValue::Int(i) => i.to_string().into_bytes(),
            DynValue::Float(fl) => fl.to_string().into_bytes(),
            DynValue::Bool(b) => b.to_string().into_bytes(),
            DynValue::Null => Vec::new(),
            DynValue::List(_) | DynValue::Map(_) => Vec::new(),
        }
    }
}

impl From<serde_json::Value> for DynValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => DynValue::Null,
            serde_json::Value::Bool(b) => DynValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DynValue::Int(i)
                } else {
                    DynValue::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => DynValue::String(s),
            serde_json::Value::Array(a) => {
                DynValue::List(a.into_iter().map(DynValue::from).collect())
            }
            serde_json::Value::Object(o) => DynValue::Map(
                o.into_iter()
                    .map(|(k, v)| (k, DynValue::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_nested_json() {
        let j: serde_json::Value =
            serde_json::from_str(r#"{"user":{"name":"ADMIN"}}"#).unwrap();
        let dv = DynValue::from(j);
        let user = dv.as_map().unwrap().get("user").unwrap();
        let name = user.as_map().unwrap().get("name").unwrap();
        assert_eq!(name.as_str(), Some("ADMIN"));
    }

    #[test]
    fn scan_bytes_renders_scalars() {
        assert_eq!(DynValue::Int(3).to_scan_bytes(), b"3".to_vec());
        assert_eq!(
            DynValue::String("x".into()).to_scan_bytes(),
            b"x".to_vec()
        );
    }
}
