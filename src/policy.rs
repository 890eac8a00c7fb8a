//! Access control policy.
//!
//! Everything here is pure: given the configured [`SecurityMode`] and the
//! caller's user id (if any), compute which documents the caller may see or
//! change and which ACL a new document receives.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::engine::Filter;
use crate::{Document, Error};

/// ACL entry granting access to everyone.
pub const ACL_ALL: &str = "all";

/// Document field listing who may read it.
pub const ACL_READ_FIELD: &str = "aclRead";
/// Document field listing who may update or delete it.
pub const ACL_WRITE_FIELD: &str = "aclWrite";

/// Global policy deciding default ACLs and whether writes need a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// Anyone can read, edit and delete every document.
    Open,
    /// Users read, edit and delete only the documents they created.
    #[default]
    OwnerSandbox,
    /// Users read every document but edit and delete only their own.
    ReadAllWriteOwn,
}

impl SecurityMode {
    /// Whether anonymous callers are refused on every write.
    pub fn requires_auth_for_write(self) -> bool {
        match self {
            SecurityMode::Open => false,
            SecurityMode::OwnerSandbox | SecurityMode::ReadAllWriteOwn => true,
        }
    }

    /// Default `(aclRead, aclWrite)` for a document created by `caller`.
    pub fn default_acl(self, caller: Option<&str>) -> (Vec<String>, Vec<String>) {
        let all = || vec![ACL_ALL.to_string()];
        let own = || caller.map(|id| vec![id.to_string()]).unwrap_or_default();
        match self {
            SecurityMode::Open => (all(), all()),
            SecurityMode::ReadAllWriteOwn => (all(), own()),
            SecurityMode::OwnerSandbox => (own(), own()),
        }
    }

    /// Fills in `aclRead` / `aclWrite` when the document lacks them.
    ///
    /// A non-empty ACL supplied by the caller is left untouched.
    pub fn apply_default_acl(self, caller: Option<&str>, doc: &mut Document) {
        let (read, write) = self.default_acl(caller);
        if acl_is_unset(doc.get(ACL_READ_FIELD)) {
            doc.insert(ACL_READ_FIELD.to_string(), acl_value(read));
        }
        if acl_is_unset(doc.get(ACL_WRITE_FIELD)) {
            doc.insert(ACL_WRITE_FIELD.to_string(), acl_value(write));
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SecurityMode::Open => "open",
            SecurityMode::OwnerSandbox => "owner-sandbox",
            SecurityMode::ReadAllWriteOwn => "read-all-write-own",
        };
        f.write_str(name)
    }
}

impl FromStr for SecurityMode {
    type Err = Error;

    /// Accepts the kebab-case names as well as the numeric codes `0`, `1`, `2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "none" | "0" => Ok(SecurityMode::Open),
            "owner-sandbox" | "user-sandbox" | "1" => Ok(SecurityMode::OwnerSandbox),
            "read-all-write-own" | "read-all" | "2" => Ok(SecurityMode::ReadAllWriteOwn),
            other => Err(Error::InvalidInput(format!("unknown security mode: {}", other))),
        }
    }
}

fn acl_is_unset(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn acl_value(ids: Vec<String>) -> Value {
    Value::Array(ids.into_iter().map(Value::String).collect())
}

fn acl_filter(field: &str, caller: Option<&str>) -> Filter {
    let mut allowed = vec![ACL_ALL.to_string()];
    if let Some(id) = caller {
        allowed.insert(0, id.to_string());
    }
    Filter::ContainsAny(field.to_string(), allowed)
}

/// Documents whose `aclRead` contains the caller or `all`.
pub fn read_filter(caller: Option<&str>) -> Filter {
    acl_filter(ACL_READ_FIELD, caller)
}

/// Documents whose `aclWrite` contains the caller or `all`.
pub fn write_filter(caller: Option<&str>) -> Filter {
    acl_filter(ACL_WRITE_FIELD, caller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_default_acl_table() {
        let all = vec!["all".to_string()];
        let own = vec!["u1".to_string()];
        assert_eq!(SecurityMode::Open.default_acl(Some("u1")), (all.clone(), all.clone()));
        assert_eq!(SecurityMode::ReadAllWriteOwn.default_acl(Some("u1")), (all.clone(), own.clone()));
        assert_eq!(SecurityMode::OwnerSandbox.default_acl(Some("u1")), (own.clone(), own.clone()));
    }

    #[test]
    fn test_requires_auth_for_write() {
        assert!(!SecurityMode::Open.requires_auth_for_write());
        assert!(SecurityMode::OwnerSandbox.requires_auth_for_write());
        assert!(SecurityMode::ReadAllWriteOwn.requires_auth_for_write());
    }

    #[test]
    fn test_explicit_acl_wins() {
        let mut d = doc(json!({"aclRead": ["u1", "u2"], "aclWrite": []}));
        SecurityMode::OwnerSandbox.apply_default_acl(Some("u1"), &mut d);
        assert_eq!(d["aclRead"], json!(["u1", "u2"]));
        assert_eq!(d["aclWrite"], json!(["u1"]));
    }

    #[test]
    fn test_filters() {
        let owned = doc(json!({"aclRead": ["u1"], "aclWrite": ["u1"]}));
        let public = doc(json!({"aclRead": ["all"], "aclWrite": ["u1"]}));

        assert!(read_filter(Some("u1")).matches(&owned));
        assert!(!read_filter(Some("u2")).matches(&owned));
        assert!(read_filter(Some("u2")).matches(&public));
        assert!(read_filter(None).matches(&public));
        assert!(!write_filter(Some("u2")).matches(&public));
        assert!(!write_filter(None).matches(&owned));
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!("open".parse::<SecurityMode>().unwrap(), SecurityMode::Open);
        assert_eq!("1".parse::<SecurityMode>().unwrap(), SecurityMode::OwnerSandbox);
        assert_eq!("Read-All-Write-Own".parse::<SecurityMode>().unwrap(), SecurityMode::ReadAllWriteOwn);
        assert!("sometimes".parse::<SecurityMode>().is_err());
        assert_eq!(SecurityMode::default().to_string(), "owner-sandbox");
    }
}
