//! Per-kind customization: default documents and field validation.

use std::fmt;
use std::rc::Rc;

use resync_core::{str_at, Json};
use resync_cow::Tracker;
use rustc_hash::FxHashMap;
use serde_json::json;

/// A record kind. The default document seeds records made by
/// [`Collection::create`](crate::Collection::create).
pub trait Kind {
    fn name(&self) -> &str;

    /// Must carry `kind` plus `metadata.name` and `metadata.namespace`.
    fn default_document(&self) -> Json;

    /// Field errors as `(field path, message)`, checked on top of the name rules.
    fn validate(&self, _yaml: &Tracker) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Fallback for kinds nobody registered.
#[derive(Debug, Clone)]
pub struct GenericKind {
    name: String,
}

impl GenericKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Kind for GenericKind {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_document(&self) -> Json {
        json!({"kind": self.name, "metadata": {"name": "", "namespace": "default"}})
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("kind {0} is already registered")]
    Duplicate(String),
    #[error("default document for kind {kind} is invalid: {reason}")]
    InvalidDefault { kind: String, reason: &'static str },
}

/// Maps kind names to their [`Kind`] implementation.
#[derive(Default)]
pub struct KindRegistry {
    kinds: FxHashMap<String, Rc<dyn Kind>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Kind + 'static) -> Result<(), RegistryError> {
        let name = kind.name().to_owned();
        if self.kinds.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        check_default(&name, &kind.default_document())
            .map_err(|reason| RegistryError::InvalidDefault { kind: name.clone(), reason })?;
        self.kinds.insert(name, Rc::new(kind));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Rc<dyn Kind>> {
        self.kinds.get(name).cloned()
    }

    /// The registered kind, or a [`GenericKind`] for unknown names.
    pub fn resolve(&self, name: &str) -> Rc<dyn Kind> {
        self.get(name).unwrap_or_else(|| Rc::new(GenericKind::new(name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindRegistry").field("kinds", &self.names()).finish()
    }
}

fn check_default(name: &str, doc: &Json) -> Result<(), &'static str> {
    if !doc.is_object() {
        return Err("not an object");
    }
    if str_at(doc, &["kind"]) != Some(name) {
        return Err("kind does not match the registered name");
    }
    if str_at(doc, &["metadata", "name"]).is_none() {
        return Err("metadata.name must be a string");
    }
    if str_at(doc, &["metadata", "namespace"]).is_none() {
        return Err("metadata.namespace must be a string");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl Kind for Broken {
        fn name(&self) -> &str {
            "Broken"
        }
        fn default_document(&self) -> Json {
            json!({"kind": "Broken", "metadata": {"name": "x"}})
        }
    }

    #[test]
    fn register_validates_default_document() {
        let mut reg = KindRegistry::new();
        let err = reg.register(Broken).unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidDefault { kind: "Broken".into(), reason: "metadata.namespace must be a string" }
        );
        assert!(reg.get("Broken").is_none());
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut reg = KindRegistry::new();
        reg.register(GenericKind::new("Host")).unwrap();
        assert_eq!(reg.register(GenericKind::new("Host")), Err(RegistryError::Duplicate("Host".into())));
        assert_eq!(reg.names(), vec!["Host"]);
    }

    #[test]
    fn unknown_kinds_resolve_to_generic() {
        let reg = KindRegistry::new();
        let k = reg.resolve("Mapping");
        assert_eq!(k.name(), "Mapping");
        assert_eq!(
            k.default_document(),
            json!({"kind": "Mapping", "metadata": {"name": "", "namespace": "default"}})
        );
    }
}
