//! resync core types: identity keys, change notification, name rules.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod managed;
pub mod names;
pub mod notifier;

pub use notifier::{ListenerId, Notifier};

pub type Json = serde_json::Value;

const SEP: &str = "::";
const DRAFT: &str = "draft";

/// Identity of a record, `kind::name::namespace`.
///
/// Unsaved drafts get a `draft::<token>` key instead so that two drafts with
/// the same (possibly defaulted) identity fields never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(kind: &str, name: &str, namespace: &str) -> Self {
        Self(format!("{kind}{SEP}{name}{SEP}{namespace}"))
    }

    /// Compute the identity of a document from its own `kind`,
    /// `metadata.name` and `metadata.namespace`. Missing fields count as empty.
    pub fn of(yaml: &Json) -> Self {
        let kind = str_at(yaml, &["kind"]).unwrap_or_default();
        let name = str_at(yaml, &["metadata", "name"]).unwrap_or_default();
        let namespace = str_at(yaml, &["metadata", "namespace"]).unwrap_or_default();
        Self::new(kind, name, namespace)
    }

    pub fn draft(token: &str) -> Self {
        Self(format!("{DRAFT}{SEP}{token}"))
    }

    pub fn is_draft(&self) -> bool {
        self.0.starts_with(DRAFT) && self.0[DRAFT.len()..].starts_with(SEP)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(kind, name, namespace)`; `None` for draft keys.
    pub fn parts(&self) -> Option<(&str, &str, &str)> {
        if self.is_draft() {
            return None;
        }
        let mut it = self.0.splitn(3, SEP);
        Some((it.next()?, it.next()?, it.next()?))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource key {0:?} (expect Kind::name::namespace)")]
pub struct KeyParseError(pub String);

impl FromStr for ResourceKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = s.split(SEP).collect();
        match parts.as_slice() {
            [kind, name, namespace] if !kind.is_empty() && !name.is_empty() && *kind != DRAFT => {
                Ok(Self::new(kind, name, namespace))
            }
            _ => Err(KeyParseError(s.to_string())),
        }
    }
}

/// Follow `path` through nested objects and return the string found there.
pub fn str_at<'a>(yaml: &'a Json, path: &[&str]) -> Option<&'a str> {
    let mut cur = yaml;
    for seg in path {
        cur = cur.get(seg)?;
    }
    cur.as_str()
}
