//! In-process store. Requests queue until [`MemoryStore::process`] so callers
//! (and tests) control exactly when writes land and when listings arrive.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;

use resync_core::managed::strip_server_fields;
use resync_core::{Json, ResourceKey};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::debug;

use crate::collection::{Collection, WeakCollection};
use crate::kind::KindRegistry;
use crate::{Completion, Store, StoreError};

enum Request {
    Apply(Json, Completion),
    Delete(Json, Completion),
}

#[derive(Default)]
struct Objects {
    map: FxHashMap<ResourceKey, Json>,
    order: Vec<ResourceKey>,
}

#[derive(Default)]
pub struct MemoryStore {
    kinds: KindRegistry,
    objects: RefCell<Objects>,
    queue: RefCell<VecDeque<Request>>,
    failure: RefCell<Option<String>>,
    subscribers: RefCell<Vec<WeakCollection>>,
    next_version: Cell<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kinds(kinds: KindRegistry) -> Self {
        Self { kinds, ..Self::default() }
    }

    /// A store that rejects every write with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        let store = Self::new();
        store.set_failure(Some(reason.into()));
        store
    }

    pub fn set_failure(&self, reason: Option<String>) {
        *self.failure.borrow_mut() = reason;
    }

    /// Store a document directly, as if another client had applied it.
    pub fn seed(&self, yaml: Json) -> ResourceKey {
        self.put(yaml)
    }

    /// Delete directly, as if another client had. Returns whether it existed.
    pub fn remove(&self, key: &ResourceKey) -> bool {
        let mut objects = self.objects.borrow_mut();
        if objects.map.remove(key).is_none() {
            return false;
        }
        objects.order.retain(|k| k != key);
        true
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Json> {
        self.objects.borrow().map.get(key).cloned()
    }

    /// Current contents in insertion order.
    pub fn listing(&self) -> Vec<Json> {
        let objects = self.objects.borrow();
        objects.order.iter().filter_map(|k| objects.map.get(k).cloned()).collect()
    }

    pub fn queued(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Run every queued request and complete it. Returns how many ran.
    pub fn process(&self) -> usize {
        let requests: Vec<Request> = self.queue.borrow_mut().drain(..).collect();
        let count = requests.len();
        for request in requests {
            let failure = self.failure.borrow().clone();
            match request {
                Request::Apply(_, done) | Request::Delete(_, done) if failure.is_some() => {
                    done.complete(Err(StoreError::Rejected(failure.unwrap_or_default())));
                }
                Request::Apply(yaml, done) => {
                    let key = self.put(yaml);
                    debug!(key = %key, "memory store applied");
                    done.complete(Ok(()));
                }
                Request::Delete(yaml, done) => {
                    let key = ResourceKey::of(&yaml);
                    if self.remove(&key) {
                        debug!(key = %key, "memory store deleted");
                        done.complete(Ok(()));
                    } else {
                        done.complete(Err(StoreError::NotFound(key)));
                    }
                }
            }
        }
        count
    }

    /// Push the current listing to every live subscriber.
    pub fn poll(&self) {
        let subscribers: Vec<Collection> = {
            let mut subs = self.subscribers.borrow_mut();
            subs.retain(|w| w.upgrade().is_some());
            subs.iter().filter_map(WeakCollection::upgrade).collect()
        };
        for collection in subscribers {
            collection.reconcile(self.listing());
        }
    }

    /// [`process`](Self::process) then [`poll`](Self::poll).
    pub fn settle(&self) {
        self.process();
        self.poll();
    }

    fn put(&self, mut yaml: Json) -> ResourceKey {
        strip_server_fields(&mut yaml);
        let version = self.next_version.get() + 1;
        self.next_version.set(version);
        if let Some(meta) = yaml.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("resourceVersion".to_owned(), Value::String(version.to_string()));
        }
        let key = ResourceKey::of(&yaml);
        let mut objects = self.objects.borrow_mut();
        if objects.map.insert(key.clone(), yaml).is_none() {
            objects.order.push(key.clone());
        }
        key
    }
}

impl Store for MemoryStore {
    fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    fn apply(&self, _collection: &Collection, yaml: Json, done: Completion) {
        self.queue.borrow_mut().push_back(Request::Apply(yaml, done));
    }

    fn delete(&self, _collection: &Collection, yaml: Json, done: Completion) {
        self.queue.borrow_mut().push_back(Request::Delete(yaml, done));
    }

    fn subscribe(&self, collection: &Collection) {
        self.subscribers.borrow_mut().push(collection.downgrade());
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("objects", &self.objects.borrow().map.len())
            .field("queued", &self.queued())
            .field("failure", &self.failure.borrow())
            .finish()
    }
}
