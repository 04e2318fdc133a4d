//! Identity-keyed set of records and listing reconciliation.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

use metrics::{counter, histogram};
use resync_core::{str_at, Json, ListenerId, Notifier, ResourceKey};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::record::{LifecycleError, Record};
use crate::Store;

#[derive(Debug, Clone)]
pub enum CollectionEvent {
    Added(Record),
    Removed(Record),
    Reconciled { loaded: usize, removed: usize },
}

/// Keyed records in insertion order.
#[derive(Default)]
struct Keyed {
    map: FxHashMap<ResourceKey, Record>,
    order: Vec<ResourceKey>,
}

impl Keyed {
    fn insert(&mut self, key: ResourceKey, record: Record) {
        if self.map.insert(key.clone(), record).is_none() {
            self.order.push(key);
        }
    }

    fn remove(&mut self, key: &ResourceKey) -> Option<Record> {
        let record = self.map.remove(key)?;
        self.order.retain(|k| k != key);
        Some(record)
    }
}

pub(crate) struct CollectionInner {
    store: Rc<dyn Store>,
    next_seq: Cell<u64>,
    /// Unsaved records in creation order.
    drafts: RefCell<Vec<Record>>,
    keyed: RefCell<Keyed>,
    notifier: Notifier<CollectionEvent>,
}

/// All records known to the client: unsaved drafts plus records keyed by
/// identity.
///
/// Iteration yields drafts in creation order, then keyed records in the
/// order they were first inserted.
#[derive(Clone)]
pub struct Collection(Rc<CollectionInner>);

/// Non-owning handle, for loops that should stop once the collection is gone.
#[derive(Clone)]
pub struct WeakCollection(Weak<CollectionInner>);

impl WeakCollection {
    pub fn upgrade(&self) -> Option<Collection> {
        self.0.upgrade().map(Collection)
    }
}

impl fmt::Debug for WeakCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCollection").field("alive", &(self.0.strong_count() > 0)).finish()
    }
}

impl Collection {
    pub fn new(store: Rc<dyn Store>) -> Self {
        Self(Rc::new(CollectionInner {
            store,
            next_seq: Cell::new(0),
            drafts: RefCell::new(Vec::new()),
            keyed: RefCell::new(Keyed::default()),
            notifier: Notifier::new(),
        }))
    }

    pub fn store(&self) -> Rc<dyn Store> {
        Rc::clone(&self.0.store)
    }

    /// Ask the store to start feeding this collection.
    pub fn subscribe(&self) {
        self.store().subscribe(self);
    }

    /// A new unsaved record of `kind`, seeded with the kind's default document.
    pub fn create(&self, kind: &str) -> Record {
        let record = self.0.store.instantiate(self, kind);
        self.0.drafts.borrow_mut().push(record.clone());
        debug!(key = %record.key(), kind, "created draft");
        self.0.notifier.notify(&CollectionEvent::Added(record.clone()));
        record
    }

    /// Upsert by identity: the existing record for the document's key loads
    /// it, otherwise a new record is instantiated, inserted and loaded.
    pub fn load(&self, yaml: Json) -> Record {
        let key = ResourceKey::of(&yaml);
        if let Some(record) = self.get(&key) {
            record.load(yaml);
            return record;
        }
        let kind = str_at(&yaml, &["kind"]).unwrap_or_default().to_owned();
        let record = self.0.store.instantiate(self, &kind);
        record.assign_key(Some(key.clone()));
        self.0.keyed.borrow_mut().insert(key, record.clone());
        self.0.notifier.notify(&CollectionEvent::Added(record.clone()));
        record.load(yaml);
        record
    }

    /// Drop keyed records whose key is not in `keys`, returning how many
    /// were removed.
    ///
    /// Drafts and pending creates are kept. Records with edits become
    /// zombies instead of disappearing. Removal confirms a pending delete.
    pub fn intersect(&self, keys: &FxHashSet<ResourceKey>) -> usize {
        let absent: Vec<Record> = {
            let keyed = self.0.keyed.borrow();
            keyed.order.iter().filter(|k| !keys.contains(*k)).filter_map(|k| keyed.map.get(k).cloned()).collect()
        };
        let mut gone = Vec::new();
        for record in absent {
            if record.is_new() {
                continue;
            }
            if record.is_modified() && !record.is_deleted() {
                if record.zombify() {
                    counter!("resync_zombies_total", 1);
                }
                continue;
            }
            gone.push(record);
        }
        if gone.is_empty() {
            return 0;
        }
        {
            let mut keyed = self.0.keyed.borrow_mut();
            let keys: FxHashSet<ResourceKey> = gone.iter().map(Record::key).collect();
            keyed.map.retain(|k, _| !keys.contains(k));
            keyed.order.retain(|k| !keys.contains(k));
        }
        for record in &gone {
            record.forget();
            self.0.notifier.notify(&CollectionEvent::Removed(record.clone()));
        }
        gone.len()
    }

    /// Merge a complete listing: load every document, then intersect with
    /// the listed keys.
    pub fn reconcile(&self, yamls: impl IntoIterator<Item = Json>) {
        let started = Instant::now();
        let mut keys = FxHashSet::default();
        let mut loaded = 0usize;
        for yaml in yamls {
            keys.insert(ResourceKey::of(&yaml));
            self.load(yaml);
            loaded += 1;
        }
        let removed = self.intersect(&keys);
        counter!("resync_reconcile_total", 1);
        histogram!("resync_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(loaded, removed, "reconciled");
        self.0.notifier.notify(&CollectionEvent::Reconciled { loaded, removed });
    }

    pub fn contains(&self, record: &Record) -> bool {
        if self.0.drafts.borrow().contains(record) {
            return true;
        }
        self.0.keyed.borrow().map.get(&record.key()) == Some(record)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Record> {
        self.0.keyed.borrow().map.get(key).cloned()
    }

    /// Snapshot in iteration order.
    pub fn records(&self) -> Vec<Record> {
        let mut out = self.0.drafts.borrow().clone();
        let keyed = self.0.keyed.borrow();
        out.extend(keyed.order.iter().filter_map(|k| keyed.map.get(k).cloned()));
        out
    }

    pub fn len(&self) -> usize {
        self.0.drafts.borrow().len() + self.0.keyed.borrow().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_listener(&self, f: impl Fn(&CollectionEvent) + 'static) -> ListenerId {
        self.0.notifier.add_listener(f)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.0.notifier.remove_listener(id)
    }

    pub fn downgrade(&self) -> WeakCollection {
        WeakCollection(Rc::downgrade(&self.0))
    }

    pub(crate) fn from_inner(inner: Rc<CollectionInner>) -> Self {
        Self(inner)
    }

    pub(crate) fn downgrade_inner(&self) -> Weak<CollectionInner> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn next_seq(&self) -> u64 {
        let seq = self.0.next_seq.get();
        self.0.next_seq.set(seq + 1);
        seq
    }

    /// Move a draft into the keyed bucket under `key`.
    pub(crate) fn promote(&self, record: &Record, key: ResourceKey) -> Result<(), LifecycleError> {
        {
            let mut keyed = self.0.keyed.borrow_mut();
            match keyed.map.get(&key) {
                Some(existing) if existing == record => return Ok(()),
                Some(_) => return Err(LifecycleError::KeyTaken(key)),
                None => {}
            }
            self.0.drafts.borrow_mut().retain(|r| r != record);
            keyed.insert(key.clone(), record.clone());
        }
        record.assign_key(Some(key));
        Ok(())
    }

    /// Undo [`promote`](Self::promote) after a failed create: the record
    /// goes back among the drafts at its creation position.
    pub(crate) fn demote(&self, record: &Record) {
        let key = record.key();
        {
            let mut keyed = self.0.keyed.borrow_mut();
            if keyed.map.get(&key) != Some(record) {
                return;
            }
            keyed.remove(&key);
        }
        record.assign_key(None);
        let mut drafts = self.0.drafts.borrow_mut();
        let at = drafts.partition_point(|r| r.seq() < record.seq());
        drafts.insert(at, record.clone());
    }

    /// Remove a record from whichever bucket holds it.
    pub(crate) fn discard(&self, record: &Record) {
        let found = {
            let mut drafts = self.0.drafts.borrow_mut();
            let before = drafts.len();
            drafts.retain(|r| r != record);
            drafts.len() != before
        } || {
            let key = record.key();
            let mut keyed = self.0.keyed.borrow_mut();
            keyed.map.get(&key) == Some(record) && keyed.remove(&key).is_some()
        };
        if found {
            self.0.notifier.notify(&CollectionEvent::Removed(record.clone()));
        }
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records().into_iter()
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("drafts", &self.0.drafts.borrow().len())
            .field("keyed", &self.0.keyed.borrow().map.len())
            .finish()
    }
}
