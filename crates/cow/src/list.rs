use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use serde::{Serialize, Serializer};

use crate::{noop, Base, CowError, Hook, Json, Node, OnChange, Seg, Tracker, NULL};

enum Item {
    Original(usize),
    Value(Json),
    Object(Tracker),
    List(TrackedList),
}

/// Copy-on-write view of a JSON array.
///
/// Structural operations (insert, remove, splice, reorder) are recorded as a
/// list of items that either point back into the original array or hold a
/// written value, so untouched elements are never cloned.
pub struct TrackedList {
    base: Base,
    items: Vec<Item>,
    hook: Hook,
}

fn element(base: &Base, index: usize) -> &Json {
    base.value().as_array().and_then(|a| a.get(index)).unwrap_or(&NULL)
}

impl TrackedList {
    pub fn new(values: Vec<Json>) -> Self {
        Self::wrap(Rc::new(Json::Array(values)), noop())
    }

    pub fn wrap(root: Rc<Json>, on_change: OnChange) -> Self {
        Self::nested(Base::new(root), Hook::new(on_change))
    }

    pub(crate) fn nested(base: Base, hook: Hook) -> Self {
        let len = base.value().as_array().map_or(0, Vec::len);
        Self { base, items: (0..len).map(Item::Original).collect(), hook }
    }

    pub fn original(&self) -> &Json {
        self.base.value()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Node<'_>> {
        Some(match self.items.get(index)? {
            Item::Original(i) => Node::Value(element(&self.base, *i)),
            Item::Value(v) => Node::Value(v),
            Item::Object(t) => Node::Object(t),
            Item::List(l) => Node::List(l),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Node<'_>> + '_ {
        (0..self.items.len()).filter_map(move |i| self.get(i))
    }

    fn bounds(index: usize, limit: usize) -> Result<(), CowError> {
        if index < limit {
            Ok(())
        } else {
            Err(CowError::OutOfBounds { index, len: limit })
        }
    }

    fn materialize(&self, item: Item) -> Json {
        match item {
            Item::Original(i) => element(&self.base, i).clone(),
            Item::Value(v) => v,
            Item::Object(t) => t.to_json(),
            Item::List(l) => l.to_json(),
        }
    }

    pub fn set(&mut self, index: usize, value: Json) -> Result<(), CowError> {
        Self::bounds(index, self.items.len())?;
        self.hook.fire()?;
        self.items[index] = Item::Value(value);
        Ok(())
    }

    pub fn push(&mut self, value: Json) -> Result<(), CowError> {
        self.hook.fire()?;
        self.items.push(Item::Value(value));
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Option<Json>, CowError> {
        self.hook.fire()?;
        Ok(self.items.pop().map(|it| self.materialize(it)))
    }

    pub fn insert(&mut self, index: usize, value: Json) -> Result<(), CowError> {
        Self::bounds(index, self.items.len() + 1)?;
        self.hook.fire()?;
        self.items.insert(index, Item::Value(value));
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<Json, CowError> {
        Self::bounds(index, self.items.len())?;
        self.hook.fire()?;
        let item = self.items.remove(index);
        Ok(self.materialize(item))
    }

    /// Replace `range` with `values`, returning the removed elements.
    pub fn splice(
        &mut self,
        range: Range<usize>,
        values: impl IntoIterator<Item = Json>,
    ) -> Result<Vec<Json>, CowError> {
        let len = self.items.len();
        if range.start > range.end || range.end > len {
            return Err(CowError::OutOfBounds { index: range.end.max(range.start), len });
        }
        self.hook.fire()?;
        let removed: Vec<Item> = self.items.splice(range, values.into_iter().map(Item::Value)).collect();
        Ok(removed.into_iter().map(|it| self.materialize(it)).collect())
    }

    pub fn reverse(&mut self) -> Result<(), CowError> {
        self.hook.fire()?;
        self.items.reverse();
        Ok(())
    }

    pub fn sort_by(&mut self, mut compare: impl FnMut(&Json, &Json) -> Ordering) -> Result<(), CowError> {
        self.hook.fire()?;
        let items = std::mem::take(&mut self.items);
        let mut values: Vec<Json> = items.into_iter().map(|it| self.materialize(it)).collect();
        values.sort_by(|a, b| compare(a, b));
        self.items = values.into_iter().map(Item::Value).collect();
        Ok(())
    }

    /// Borrow the object at `index` for writing, wrapping it on first access.
    pub fn object_mut(&mut self, index: usize) -> Option<&mut Tracker> {
        let (base, hook) = (&self.base, &self.hook);
        let item = self.items.get_mut(index)?;
        let fresh = match item {
            Item::Original(i) if element(base, *i).is_object() => {
                Some(Tracker::nested(base.child(Seg::Index(*i)), hook.child()))
            }
            Item::Value(v @ Json::Object(_)) => {
                Some(Tracker::nested(Base::new(Rc::new(std::mem::take(v))), hook.child()))
            }
            _ => None,
        };
        if let Some(t) = fresh {
            *item = Item::Object(t);
        }
        match item {
            Item::Object(t) => Some(t),
            _ => None,
        }
    }

    /// Borrow the array at `index` for writing, wrapping it on first access.
    pub fn list_mut(&mut self, index: usize) -> Option<&mut TrackedList> {
        let (base, hook) = (&self.base, &self.hook);
        let item = self.items.get_mut(index)?;
        let fresh = match item {
            Item::Original(i) if element(base, *i).is_array() => {
                Some(TrackedList::nested(base.child(Seg::Index(*i)), hook.child()))
            }
            Item::Value(v @ Json::Array(_)) => {
                Some(TrackedList::nested(Base::new(Rc::new(std::mem::take(v))), hook.child()))
            }
            _ => None,
        };
        if let Some(l) = fresh {
            *item = Item::List(l);
        }
        match item {
            Item::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Json {
        Json::Array(
            self.items
                .iter()
                .map(|it| match it {
                    Item::Original(i) => element(&self.base, *i).clone(),
                    Item::Value(v) => v.clone(),
                    Item::Object(t) => t.to_json(),
                    Item::List(l) => l.to_json(),
                })
                .collect(),
        )
    }

    pub fn mutated(&self) -> bool {
        self.hook.mutated()
    }
}

impl fmt::Debug for TrackedList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedList")
            .field("value", &self.to_json())
            .field("mutated", &self.mutated())
            .finish()
    }
}

impl Serialize for TrackedList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
