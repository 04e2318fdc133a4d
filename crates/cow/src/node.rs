use std::fmt;

use crate::{Json, TrackedList, Tracker};

/// Read-only view of a value inside a tracked tree: either plain JSON (from
/// the original or a raw write) or one of the wrappers.
#[derive(Clone, Copy)]
pub enum Node<'a> {
    Value(&'a Json),
    Object(&'a Tracker),
    List(&'a TrackedList),
}

impl<'a> Node<'a> {
    /// Field of an object, or element of an array when `key` is numeric.
    pub fn get(self, key: &str) -> Option<Node<'a>> {
        match self {
            Node::Object(t) => t.get(key),
            Node::List(l) => l.get(key.parse().ok()?),
            Node::Value(Json::Object(m)) => m.get(key).map(Node::Value),
            Node::Value(Json::Array(a)) => a.get(key.parse::<usize>().ok()?).map(Node::Value),
            Node::Value(_) => None,
        }
    }

    pub fn index(self, index: usize) -> Option<Node<'a>> {
        match self {
            Node::List(l) => l.get(index),
            Node::Value(Json::Array(a)) => a.get(index).map(Node::Value),
            _ => None,
        }
    }

    /// The underlying JSON when this is a plain value.
    pub fn as_json(self) -> Option<&'a Json> {
        match self {
            Node::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(self) -> Option<&'a str> {
        self.as_json()?.as_str()
    }

    pub fn as_i64(self) -> Option<i64> {
        self.as_json()?.as_i64()
    }

    pub fn as_u64(self) -> Option<u64> {
        self.as_json()?.as_u64()
    }

    pub fn as_f64(self) -> Option<f64> {
        self.as_json()?.as_f64()
    }

    pub fn as_bool(self) -> Option<bool> {
        self.as_json()?.as_bool()
    }

    pub fn is_null(self) -> bool {
        matches!(self, Node::Value(Json::Null))
    }

    pub fn is_object(self) -> bool {
        matches!(self, Node::Object(_) | Node::Value(Json::Object(_)))
    }

    pub fn is_array(self) -> bool {
        matches!(self, Node::List(_) | Node::Value(Json::Array(_)))
    }

    pub fn to_json(self) -> Json {
        match self {
            Node::Value(v) => v.clone(),
            Node::Object(t) => t.to_json(),
            Node::List(l) => l.to_json(),
        }
    }
}

impl PartialEq<Json> for Node<'_> {
    fn eq(&self, other: &Json) -> bool {
        match self {
            Node::Value(v) => *v == other,
            _ => self.to_json() == *other,
        }
    }
}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Value(v) => fmt::Debug::fmt(v, f),
            Node::Object(t) => fmt::Debug::fmt(t, f),
            Node::List(l) => fmt::Debug::fmt(l, f),
        }
    }
}
