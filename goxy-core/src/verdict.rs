use std::fmt;

use crate::context::ProxyContext;
use crate::error::CoreError;

/// Side-effecting mutator run when a rule matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    SetFlag { key: String },
    Increment { key: String },
    Decrement { key: String },
    Alert { reason: String },
    NoOp,
}

impl Verdict {
    /// Compiles a descriptor string into a `Verdict`.
    ///
    /// `""` -> NoOp, `"drop"`/`"accept"` -> SetFlag, `"inc::K"`/`"dec::K"` ->
    /// Increment/Decrement, `"alert::REASON"` -> Alert. Anything else is
    /// `MalformedVerdict`.
    pub fn parse(desc: &str) -> Result<Self, CoreError> {
        if desc.is_empty() {
            return Ok(Verdict::NoOp);
        }
        if desc == "drop" {
            return Ok(Verdict::SetFlag {
                key: crate::context::FLAG_DROP.to_string(),
            });
        }
        if desc == "accept" {
            return Ok(Verdict::SetFlag {
                key: crate::context::FLAG_ACCEPT.to_string(),
            });
        }
        if let Some(key) = desc.strip_prefix("inc::") {
            if key.is_empty() {
                return Err(CoreError::MalformedVerdict(desc.to_string()));
            }
            return Ok(Verdict::Increment {
                key: key.to_string(),
            });
        }
        if let Some(key) = desc.strip_prefix("dec::") {
            if key.is_empty() {
                return Err(CoreError::MalformedVerdict(desc.to_string()));
            }
            return Ok(Verdict::Decrement {
                key: key.to_string(),
            });
        }
        if let Some(reason) = desc.strip_prefix("alert::") {
            if reason.is_empty() {
                return Err(CoreError::MalformedVerdict(desc.to_string()));
            }
            return Ok(Verdict::Alert {
                reason: reason.to_string(),
            });
        }
        Err(CoreError::MalformedVerdict(desc.to_string()))
    }

    /// Applies this verdict's effect to the context. `Alert` additionally
    /// emits one warning-level log line whose fields are the context dump
    /// plus a fixed `reason` field.
    pub fn mutate(&self, ctx: &ProxyContext) {
        match self {
            Verdict::SetFlag { key } => ctx.set_flag(key),
            Verdict::Increment { key } => {
                ctx.add_to_counter(key, 1);
            }
            Verdict::Decrement { key } => {
                ctx.add_to_counter(key, -1);
            }
            Verdict::Alert { reason } => {
                let fields = ctx.dump_fields();
                log::warn!(
                    "alert fired: reason={} fields={:?}",
                    reason,
                    fields
                );
            }
            Verdict::NoOp => {}
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::SetFlag { key } => write!(f, "set '{key}'"),
            Verdict::Increment { key } => write!(f, "inc '{key}'"),
            Verdict::Decrement { key } => write!(f, "dec '{key}'"),
            Verdict::Alert { .. } => write!(f, "alert"),
            Verdict::NoOp => write!(f, "dummy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_grammar_form() {
        assert_eq!(Verdict::parse("").unwrap(), Verdict::NoOp);
        assert_eq!(
            Verdict::parse("drop").unwrap(),
            Verdict::SetFlag {
                key: "drop".to_string()
            }
        );
        assert_eq!(
            Verdict::parse("inc::gets").unwrap(),
            Verdict::Increment {
                key: "gets".to_string()
            }
        );
        assert_eq!(
            Verdict::parse("alert::admin-login").unwrap(),
            Verdict::Alert {
                reason: "admin-login".to_string()
            }
        );
    }

    #[test]
    fn rejects_unknown_descriptor() {
        assert!(Verdict::parse("bogus").is_err());
        assert!(Verdict::parse("inc::").is_err());
    }

    #[test]
    fn increment_mutates_counter() {
        let ctx = ProxyContext::new();
        let v = Verdict::parse("inc::gets").unwrap();
        v.mutate(&ctx);
        v.mutate(&ctx);
        assert_eq!(ctx.get_counter("gets"), 2);
    }

    #[test]
    fn display_forms_match_reference() {
        assert_eq!(
            Verdict::SetFlag {
                key: "drop".into()
            }
            .to_string(),
            "set 'drop'"
        );
        assert_eq!(Verdict::NoOp.to_string(), "dummy");
    }
}
