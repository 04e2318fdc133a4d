//! Copy-on-write change tracking for JSON-like trees.
//!
//! A [`Tracker`] reads through to an immutable baseline and records every
//! write in an overlay, so the baseline (for a record, the document the remote
//! store last confirmed) is never touched. Nested objects and arrays are
//! wrapped lazily the first time they are borrowed mutably, and each wrapper
//! shares the baseline `Rc` instead of copying the subtree.
//!
//! Every write first fires an [`OnChange`] hook. Nested wrappers chain their
//! hook to the parent, so a leaf write marks every ancestor as mutated and
//! reaches the root hook, which may veto it (see [`CowError::ReadOnly`]).
//!
//! ```
//! use resync_cow::Tracker;
//! use serde_json::json;
//!
//! let mut t = Tracker::new(json!({"a": 1, "b": {"c": 2, "d": 3}}));
//! t.object_mut("b").unwrap().set("c", json!(99)).unwrap();
//! t.set("a", json!(1)).unwrap();
//! assert_eq!(serde_json::Value::Object(t.deltas()), json!({"b": {"c": 99}}));
//! assert!(t.mutated() && t.changed());
//! ```

#![forbid(unsafe_code)]

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use serde::{Serialize, Serializer};

mod list;
mod node;

pub use list::TrackedList;
pub use node::Node;

pub type Json = serde_json::Value;
pub type Map = serde_json::Map<String, Json>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CowError {
    #[error("read-only: the document cannot be modified in its current state")]
    ReadOnly,
    #[error("{0} is not an object")]
    NotAnObject(String),
    #[error("empty path")]
    EmptyPath,
    #[error("index {index} out of bounds for list of length {len}")]
    OutOfBounds { index: usize, len: usize },
}

/// Called before every write. Returning an error rejects the write.
pub type OnChange = Rc<dyn Fn() -> Result<(), CowError>>;

pub fn noop() -> OnChange {
    Rc::new(|| Ok(()))
}

pub(crate) static NULL: Json = Json::Null;

#[derive(Clone)]
pub(crate) struct Hook {
    mutated: Rc<Cell<bool>>,
    on_change: OnChange,
}

impl Hook {
    pub(crate) fn new(on_change: OnChange) -> Self {
        Self { mutated: Rc::new(Cell::new(false)), on_change }
    }

    pub(crate) fn fire(&self) -> Result<(), CowError> {
        (self.on_change)()?;
        self.mutated.set(true);
        Ok(())
    }

    /// Hook for a nested wrapper: fires this hook, so the parent is marked too.
    pub(crate) fn child(&self) -> Hook {
        let parent = self.clone();
        Hook::new(Rc::new(move || parent.fire()))
    }

    pub(crate) fn mutated(&self) -> bool {
        self.mutated.get()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Seg {
    Key(String),
    Index(usize),
}

/// A position inside an immutable shared tree.
#[derive(Debug, Clone)]
pub(crate) struct Base {
    root: Rc<Json>,
    path: Vec<Seg>,
}

impl Base {
    pub(crate) fn new(root: Rc<Json>) -> Self {
        Self { root, path: Vec::new() }
    }

    pub(crate) fn value(&self) -> &Json {
        let mut cur: &Json = &self.root;
        for seg in &self.path {
            let next = match (seg, cur) {
                (Seg::Key(k), Json::Object(m)) => m.get(k),
                (Seg::Index(i), Json::Array(a)) => a.get(*i),
                _ => None,
            };
            match next {
                Some(v) => cur = v,
                None => return &NULL,
            }
        }
        cur
    }

    pub(crate) fn child(&self, seg: Seg) -> Base {
        let mut path = self.path.clone();
        path.push(seg);
        Base { root: Rc::clone(&self.root), path }
    }

    pub(crate) fn field(&self, key: &str) -> Option<&Json> {
        self.value().as_object()?.get(key)
    }

    pub(crate) fn shares_root(&self, other: &Base) -> bool {
        Rc::ptr_eq(&self.root, &other.root)
    }
}

enum Slot {
    Write(Json),
    Object(Tracker),
    List(TrackedList),
    Tombstone,
}

/// Copy-on-write view of a JSON object.
pub struct Tracker {
    base: Base,
    writes: BTreeMap<String, Slot>,
    hook: Hook,
}

impl Tracker {
    /// Track a standalone value with a hook that accepts every write.
    pub fn new(value: Json) -> Self {
        Self::wrap(Rc::new(value), noop())
    }

    pub fn wrap(root: Rc<Json>, on_change: OnChange) -> Self {
        Self::nested(Base::new(root), Hook::new(on_change))
    }

    pub(crate) fn nested(base: Base, hook: Hook) -> Self {
        Self { base, writes: BTreeMap::new(), hook }
    }

    /// The value this tracker reads through to.
    pub fn original(&self) -> &Json {
        self.base.value()
    }

    pub fn get(&self, key: &str) -> Option<Node<'_>> {
        match self.writes.get(key) {
            Some(Slot::Write(v)) => Some(Node::Value(v)),
            Some(Slot::Object(t)) => Some(Node::Object(t)),
            Some(Slot::List(l)) => Some(Node::List(l)),
            Some(Slot::Tombstone) => None,
            None => self.base.field(key).map(Node::Value),
        }
    }

    /// Walk `path` from this object; numeric segments index into arrays.
    pub fn pointer(&self, path: &[&str]) -> Option<Node<'_>> {
        let mut cur = Node::Object(self);
        for seg in path {
            cur = cur.get(seg)?;
        }
        Some(cur)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Current keys in sorted order: original keys minus removals plus writes.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: BTreeSet<&str> = self
            .base
            .value()
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        for (k, slot) in &self.writes {
            if matches!(slot, Slot::Tombstone) {
                keys.remove(k.as_str());
            } else {
                keys.insert(k.as_str());
            }
        }
        keys.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set(&mut self, key: impl Into<String>, value: Json) -> Result<(), CowError> {
        self.hook.fire()?;
        self.writes.insert(key.into(), Slot::Write(value));
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<(), CowError> {
        self.hook.fire()?;
        self.writes.insert(key.to_owned(), Slot::Tombstone);
        Ok(())
    }

    /// Borrow the object at `key` for writing, wrapping it on first access.
    /// `None` if the key is absent or does not hold an object.
    pub fn object_mut(&mut self, key: &str) -> Option<&mut Tracker> {
        let fresh = match self.writes.get_mut(key) {
            Some(Slot::Object(_)) => None,
            Some(Slot::Write(v @ Json::Object(_))) => {
                Some(Tracker::nested(Base::new(Rc::new(std::mem::take(v))), self.hook.child()))
            }
            Some(_) => return None,
            None if self.base.field(key).map_or(false, Json::is_object) => Some(Tracker::nested(
                self.base.child(Seg::Key(key.to_owned())),
                self.hook.child(),
            )),
            None => return None,
        };
        if let Some(t) = fresh {
            self.writes.insert(key.to_owned(), Slot::Object(t));
        }
        match self.writes.get_mut(key) {
            Some(Slot::Object(t)) => Some(t),
            _ => None,
        }
    }

    /// Borrow the array at `key` for writing, wrapping it on first access.
    pub fn list_mut(&mut self, key: &str) -> Option<&mut TrackedList> {
        let fresh = match self.writes.get_mut(key) {
            Some(Slot::List(_)) => None,
            Some(Slot::Write(v @ Json::Array(_))) => {
                Some(TrackedList::nested(Base::new(Rc::new(std::mem::take(v))), self.hook.child()))
            }
            Some(_) => return None,
            None if self.base.field(key).map_or(false, Json::is_array) => Some(TrackedList::nested(
                self.base.child(Seg::Key(key.to_owned())),
                self.hook.child(),
            )),
            None => return None,
        };
        if let Some(l) = fresh {
            self.writes.insert(key.to_owned(), Slot::List(l));
        }
        match self.writes.get_mut(key) {
            Some(Slot::List(l)) => Some(l),
            _ => None,
        }
    }

    /// Set a nested field, creating missing intermediate objects.
    pub fn set_path(&mut self, path: &[&str], value: Json) -> Result<(), CowError> {
        let (last, parents) = path.split_last().ok_or(CowError::EmptyPath)?;
        let mut cur = self;
        for seg in parents {
            if cur.object_mut(seg).is_none() {
                if cur.contains_key(seg) {
                    return Err(CowError::NotAnObject((*seg).to_owned()));
                }
                cur.set(*seg, Json::Object(Map::new()))?;
            }
            cur = cur.object_mut(seg).ok_or_else(|| CowError::NotAnObject((*seg).to_owned()))?;
        }
        cur.set(*last, value)
    }

    /// Make the tracked object equal to `value`: every key of `value` is
    /// written, every other current key is removed.
    pub fn replace_with(&mut self, value: Json) -> Result<(), CowError> {
        let Json::Object(map) = value else {
            return Err(CowError::NotAnObject("document".to_owned()));
        };
        self.hook.fire()?;
        let stale: Vec<String> =
            self.keys().into_iter().filter(|k| !map.contains_key(*k)).map(str::to_owned).collect();
        for k in stale {
            self.writes.insert(k, Slot::Tombstone);
        }
        for (k, v) in map {
            self.writes.insert(k, Slot::Write(v));
        }
        Ok(())
    }

    /// Materialize the current value.
    pub fn to_json(&self) -> Json {
        let mut out = Map::new();
        if let Some(orig) = self.base.value().as_object() {
            for (k, v) in orig {
                if !self.writes.contains_key(k) {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        for (k, slot) in &self.writes {
            let v = match slot {
                Slot::Write(v) => v.clone(),
                Slot::Object(t) => t.to_json(),
                Slot::List(l) => l.to_json(),
                Slot::Tombstone => continue,
            };
            out.insert(k.clone(), v);
        }
        Json::Object(out)
    }

    /// Minimal JSON merge patch from the original to the current value.
    ///
    /// A key is reported iff its presence or its value differs; removed keys
    /// appear as `null`. Wrappers cached by reads that were never written to
    /// contribute nothing.
    pub fn deltas(&self) -> Map {
        let mut out = Map::new();
        for (k, slot) in &self.writes {
            let orig = self.base.field(k);
            match slot {
                Slot::Object(t) if t.base.shares_root(&self.base) => {
                    let d = t.deltas();
                    if !d.is_empty() {
                        out.insert(k.clone(), Json::Object(d));
                    }
                }
                Slot::Object(t) => report_if_differs(&mut out, k, orig, t.to_json()),
                Slot::List(l) => report_if_differs(&mut out, k, orig, l.to_json()),
                Slot::Write(v) => {
                    if orig != Some(v) {
                        out.insert(k.clone(), v.clone());
                    }
                }
                Slot::Tombstone => {
                    if orig.is_some() {
                        out.insert(k.clone(), Json::Null);
                    }
                }
            }
        }
        out
    }

    /// Whether any write reached this tracker or one of its nested wrappers.
    pub fn mutated(&self) -> bool {
        self.hook.mutated()
    }

    /// Whether the writes left a value that differs from the original.
    pub fn changed(&self) -> bool {
        self.mutated() && !self.deltas().is_empty()
    }
}

fn report_if_differs(out: &mut Map, key: &str, orig: Option<&Json>, now: Json) {
    if orig != Some(&now) {
        out.insert(key.to_owned(), now);
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("value", &self.to_json())
            .field("mutated", &self.mutated())
            .finish()
    }
}

impl Serialize for Tracker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
