//! One record's lifecycle: edit, save, delete, cancel, and the remote loads
//! that confirm (or conflict with) them.

use std::cell::{Cell, Ref, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use futures::channel::oneshot;
use metrics::counter;
use resync_core::names::validate_name;
use resync_core::{str_at, Json, ListenerId, Notifier, ResourceKey};
use resync_cow::{CowError, Map, OnChange, Tracker};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collection::{Collection, CollectionInner};
use crate::kind::Kind;
use crate::pending::{Outcome, Pending};
use crate::{Completion, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    New,
    PendingCreate,
    Stored,
    Modified,
    PendingSave,
    Conflicted,
    Zombie,
    Deleted,
    PendingDelete,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::New => "new",
            State::PendingCreate => "pending-create",
            State::Stored => "stored",
            State::Modified => "modified",
            State::PendingSave => "pending-save",
            State::Conflicted => "conflicted",
            State::Zombie => "zombie",
            State::Deleted => "deleted",
            State::PendingDelete => "pending-delete",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Caller contract violations. These are returned synchronously and leave
/// the record unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("cannot edit a {0} resource")]
    CannotEdit(State),
    #[error("can only save new or modified or deleted resources (state: {0})")]
    CannotSave(State),
    #[error("cannot cancel a {0} resource")]
    CannotCancel(State),
    #[error("resource is already deleted")]
    AlreadyDeleted,
    #[error("{0} already has a write in flight")]
    AlreadyPending(ResourceKey),
    #[error("{0} already exists in the collection")]
    KeyTaken(ResourceKey),
    #[error("edits changed the identity of {from} to {to}")]
    IdentityChanged { from: ResourceKey, to: ResourceKey },
    #[error("record no longer belongs to a collection")]
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Create,
    Save,
    Delete,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Save => "save",
            Op::Delete => "delete",
        }
    }
}

struct Write {
    id: u64,
    op: Op,
    tx: oneshot::Sender<Outcome>,
}

struct Inner {
    /// `None` while the record is an unsaved draft.
    key: Option<ResourceKey>,
    stored: Option<Rc<Json>>,
    stored_text: Option<String>,
    stored_version: Option<String>,
    edited: Option<Rc<Json>>,
    edited_version: Option<String>,
    yaml: Tracker,
    deleted: bool,
    pending: Option<Write>,
    synthesized: u64,
}

impl Inner {
    fn is_new(&self) -> bool {
        self.stored.is_none() && self.edited.is_none()
    }

    fn is_modified(&self) -> bool {
        self.edited.is_some()
    }

    fn state(&self) -> State {
        let pending = self.pending.is_some();
        if self.is_new() {
            return if pending { State::PendingCreate } else { State::New };
        }
        if self.deleted {
            return if pending { State::PendingDelete } else { State::Deleted };
        }
        if !self.is_modified() {
            return State::Stored;
        }
        if pending {
            return State::PendingSave;
        }
        if self.stored.is_none() {
            return State::Zombie;
        }
        if self.stored_version != self.edited_version {
            State::Conflicted
        } else {
            State::Modified
        }
    }

    fn read_only(&self) -> bool {
        self.pending.is_some() || !(self.is_new() || self.is_modified())
    }

    fn take_pending(&mut self, id: u64) -> Option<Write> {
        match &self.pending {
            Some(w) if w.id == id => self.pending.take(),
            _ => None,
        }
    }
}

struct RecordCell {
    seq: u64,
    draft: ResourceKey,
    kind: Rc<dyn Kind>,
    collection: Weak<CollectionInner>,
    writable: Rc<Cell<bool>>,
    touched: Rc<Cell<bool>>,
    hook: OnChange,
    next_write: Cell<u64>,
    inner: RefCell<Inner>,
    notifier: Notifier<Record>,
}

/// Handle to one record. Clones share the record; equality is identity.
///
/// Listeners run synchronously inside the operation that triggered them and
/// must not call [`Record::update_yaml`] on the same record.
#[derive(Clone)]
pub struct Record(Rc<RecordCell>);

/// Serializable snapshot for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub key: ResourceKey,
    pub kind: String,
    pub state: State,
    pub version: Option<String>,
}

fn guard(writable: &Rc<Cell<bool>>, touched: &Rc<Cell<bool>>) -> OnChange {
    let (writable, touched) = (writable.clone(), touched.clone());
    Rc::new(move || {
        if writable.get() {
            touched.set(true);
            Ok(())
        } else {
            Err(CowError::ReadOnly)
        }
    })
}

impl Record {
    /// A fresh unsaved record seeded with the kind's default document.
    /// It is not added to the collection; see [`Collection::create`].
    pub fn new(collection: &Collection, kind: Rc<dyn Kind>) -> Self {
        let writable = Rc::new(Cell::new(true));
        let touched = Rc::new(Cell::new(false));
        let hook = guard(&writable, &touched);
        let yaml = Tracker::wrap(Rc::new(kind.default_document()), hook.clone());
        let draft = ResourceKey::draft(&Uuid::new_v4().simple().to_string());
        Record(Rc::new(RecordCell {
            seq: collection.next_seq(),
            draft,
            kind,
            collection: collection.downgrade_inner(),
            writable,
            touched,
            hook,
            next_write: Cell::new(0),
            inner: RefCell::new(Inner {
                key: None,
                stored: None,
                stored_text: None,
                stored_version: None,
                edited: None,
                edited_version: None,
                yaml,
                deleted: false,
                pending: None,
                synthesized: 0,
            }),
            notifier: Notifier::new(),
        }))
    }

    pub fn state(&self) -> State {
        self.0.inner.borrow().state()
    }

    /// No stored document and not being edited. A zombie lost its stored
    /// document but still holds edits, so it is not new.
    pub fn is_new(&self) -> bool {
        self.0.inner.borrow().is_new()
    }

    pub fn is_modified(&self) -> bool {
        self.0.inner.borrow().is_modified()
    }

    pub fn is_deleted(&self) -> bool {
        self.0.inner.borrow().deleted
    }

    pub fn is_pending(&self) -> bool {
        self.0.inner.borrow().pending.is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.0.inner.borrow().read_only()
    }

    /// Identity key; a unique `draft::` key until the record is saved or loaded.
    pub fn key(&self) -> ResourceKey {
        self.0.inner.borrow().key.clone().unwrap_or_else(|| self.0.draft.clone())
    }

    pub fn kind(&self) -> &str {
        self.0.kind.name()
    }

    pub fn version(&self) -> Option<String> {
        self.0.inner.borrow().stored_version.clone()
    }

    /// Read access to the working tree.
    pub fn yaml(&self) -> Ref<'_, Tracker> {
        Ref::map(self.0.inner.borrow(), |i| &i.yaml)
    }

    /// Write access to the working tree. Listeners are notified once `f`
    /// returns if any write got through. Writes fail with
    /// [`CowError::ReadOnly`] unless the record is new or modified and not
    /// pending.
    ///
    /// The record stays mutably borrowed while `f` runs: `f` must only use
    /// the tracker it is given, not this record's other methods
    /// (`state`, `value`, `yaml`, ...), which would panic.
    pub fn update_yaml<R>(&self, f: impl FnOnce(&mut Tracker) -> R) -> R {
        self.0.touched.set(false);
        let out = f(&mut self.0.inner.borrow_mut().yaml);
        if self.0.touched.replace(false) {
            self.notify();
        }
        out
    }

    pub fn replace_yaml(&self, yaml: Json) -> Result<(), CowError> {
        self.update_yaml(|t| t.replace_with(yaml))
    }

    /// Materialized working tree.
    pub fn value(&self) -> Json {
        self.0.inner.borrow().yaml.to_json()
    }

    pub fn stored_yaml(&self) -> Option<Rc<Json>> {
        self.0.inner.borrow().stored.clone()
    }

    pub fn deltas(&self) -> Map {
        self.0.inner.borrow().yaml.deltas()
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            key: self.key(),
            kind: self.kind().to_owned(),
            state: self.state(),
            version: self.version(),
        }
    }

    /// Field errors keyed by dotted path. Name rules apply to
    /// `metadata.name` and `metadata.namespace`; the kind's own checks win
    /// on the same field.
    pub fn validate(&self) -> BTreeMap<String, String> {
        let inner = self.0.inner.borrow();
        let mut errors = BTreeMap::new();
        for field in ["name", "namespace"] {
            let value = inner.yaml.pointer(&["metadata", field]).and_then(|n| n.as_str()).unwrap_or_default();
            if let Some(msg) = validate_name(value) {
                errors.insert(format!("metadata.{field}"), msg.to_owned());
            }
        }
        errors.extend(self.0.kind.validate(&inner.yaml));
        errors
    }

    /// Start editing a stored copy. Idempotent while already editing.
    pub fn edit(&self) -> Result<(), LifecycleError> {
        {
            let mut inner = self.0.inner.borrow_mut();
            let state = inner.state();
            if inner.deleted {
                return Err(LifecycleError::CannotEdit(state));
            }
            if inner.is_modified() {
                return Ok(());
            }
            let Some(stored) = inner.stored.clone() else {
                return Err(LifecycleError::CannotEdit(state));
            };
            inner.edited = Some(stored.clone());
            inner.edited_version = inner.stored_version.clone();
            inner.yaml = Tracker::wrap(stored, self.0.hook.clone());
        }
        self.transition("edit");
        Ok(())
    }

    /// Drop local intent: discard a draft or a zombie, drop edits, or clear
    /// a delete mark.
    pub fn cancel(&self) -> Result<(), LifecycleError> {
        let state = self.state();
        match state {
            State::New | State::Zombie => {
                self.discard();
                Ok(())
            }
            State::Modified | State::Conflicted => {
                self.drop_edits();
                self.transition("cancel");
                Ok(())
            }
            State::Deleted => {
                self.0.inner.borrow_mut().deleted = false;
                self.transition("cancel");
                Ok(())
            }
            _ => Err(LifecycleError::CannotCancel(state)),
        }
    }

    pub fn delete(&self) -> Result<(), LifecycleError> {
        {
            let mut inner = self.0.inner.borrow_mut();
            if inner.deleted {
                return Err(LifecycleError::AlreadyDeleted);
            }
            inner.deleted = true;
        }
        self.transition("delete");
        Ok(())
    }

    /// Push local intent to the store.
    ///
    /// The record is pending (and listeners have been told) by the time this
    /// returns. No-op saves (unchanged edits, deletes of records that never
    /// reached the store) resolve at once without a store call.
    pub fn save(&self) -> Result<Pending, LifecycleError> {
        let collection = self.collection().ok_or(LifecycleError::Detached)?;
        if self.is_pending() {
            return Err(LifecycleError::AlreadyPending(self.key()));
        }
        let state = self.state();
        if self.is_deleted() {
            return match self.stored_yaml() {
                Some(stored) => Ok(self.start_write(&collection, Op::Delete, (*stored).clone())),
                None => {
                    self.discard();
                    Ok(Pending::resolved())
                }
            };
        }
        match state {
            State::New => {
                let doc = self.value();
                collection.promote(self, ResourceKey::of(&doc))?;
                Ok(self.start_write(&collection, Op::Create, doc))
            }
            State::Zombie | State::Modified | State::Conflicted => {
                // A zombie has nothing stored to compare with, so it is always re-applied.
                if state != State::Zombie && !self.yaml().changed() {
                    self.drop_edits();
                    self.transition("save-unchanged");
                    return Ok(Pending::resolved());
                }
                let doc = self.value();
                // The write is only confirmed by a listing under this record's key.
                let (from, to) = (self.key(), ResourceKey::of(&doc));
                if from != to {
                    return Err(LifecycleError::IdentityChanged { from, to });
                }
                Ok(self.start_write(&collection, Op::Save, doc))
            }
            _ => Err(LifecycleError::CannotSave(state)),
        }
    }

    /// Adopt a document from the store's latest listing.
    ///
    /// An explicit `metadata.resourceVersion` is taken as the version;
    /// otherwise a local counter bumps whenever the serialized document
    /// differs from the last one. A new version confirms an in-flight save,
    /// and any load confirms an in-flight create. Listeners are notified if
    /// the document changed or a write was confirmed.
    pub fn load(&self, yaml: Json) {
        let text = yaml.to_string();
        let explicit = str_at(&yaml, &["metadata", "resourceVersion"]).map(str::to_owned);
        let doc = Rc::new(yaml);
        let (changed, confirmed, unkeyed) = {
            let mut inner = self.0.inner.borrow_mut();
            let changed = inner.stored_text.as_deref() != Some(text.as_str());
            let version = match explicit {
                Some(v) => v,
                None => match inner.stored_version.clone() {
                    Some(v) if !changed => v,
                    _ => {
                        inner.synthesized += 1;
                        inner.synthesized.to_string()
                    }
                },
            };
            let bumped = inner.stored_version.as_deref() != Some(version.as_str());
            inner.stored = Some(doc.clone());
            inner.stored_text = Some(text);
            inner.stored_version = Some(version);

            let confirmed = match inner.pending.as_ref().map(|w| (w.id, w.op)) {
                Some((id, Op::Create)) => inner.take_pending(id),
                Some((id, Op::Save)) if bumped => {
                    inner.edited = None;
                    inner.edited_version = None;
                    inner.take_pending(id)
                }
                _ => None,
            };
            if !inner.is_modified() {
                inner.yaml = Tracker::wrap(doc.clone(), self.0.hook.clone());
            }
            (changed, confirmed, inner.key.is_none())
        };
        if unkeyed {
            // Loaded straight into a draft: it now has an identity.
            if let Some(collection) = self.collection() {
                if let Err(e) = collection.promote(self, ResourceKey::of(&doc)) {
                    warn!(key = %self.key(), error = %e, "loaded draft collides with a keyed record");
                }
            }
        }
        self.refresh();
        let confirmed = match confirmed {
            Some(write) => {
                debug!(key = %self.key(), op = write.op.as_str(), "write confirmed");
                let _ = write.tx.send(Ok(()));
                true
            }
            None => false,
        };
        if changed || confirmed {
            self.notify();
        }
    }

    pub fn add_listener(&self, f: impl Fn(&Record) + 'static) -> ListenerId {
        self.0.notifier.add_listener(f)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.0.notifier.remove_listener(id)
    }

    pub(crate) fn seq(&self) -> u64 {
        self.0.seq
    }

    pub(crate) fn assign_key(&self, key: Option<ResourceKey>) {
        self.0.inner.borrow_mut().key = key;
    }

    /// The remote object vanished while edits were in progress. Returns
    /// whether the record had a stored document to lose.
    pub(crate) fn zombify(&self) -> bool {
        {
            let mut inner = self.0.inner.borrow_mut();
            if inner.stored.is_none() {
                return false;
            }
            inner.stored = None;
            inner.stored_text = None;
            inner.stored_version = None;
        }
        self.transition("zombie");
        true
    }

    /// The record left the collection because the store no longer lists it.
    /// That absence confirms a pending delete; any other write in flight
    /// can no longer be confirmed.
    pub(crate) fn forget(&self) {
        let write = self.0.inner.borrow_mut().pending.take();
        self.refresh();
        if let Some(write) = write {
            let outcome = match write.op {
                Op::Delete => Ok(()),
                _ => Err(StoreError::NotFound(self.key())),
            };
            debug!(key = %self.key(), op = write.op.as_str(), "write settled by removal");
            let _ = write.tx.send(outcome);
        }
        self.notify();
    }

    fn collection(&self) -> Option<Collection> {
        self.0.collection.upgrade().map(Collection::from_inner)
    }

    fn notify(&self) {
        self.0.notifier.notify(self);
    }

    fn refresh(&self) {
        let read_only = self.0.inner.borrow().read_only();
        self.0.writable.set(!read_only);
    }

    fn transition(&self, what: &'static str) {
        self.refresh();
        debug!(key = %self.key(), state = %self.state(), "{what}");
        self.notify();
    }

    fn drop_edits(&self) {
        let mut inner = self.0.inner.borrow_mut();
        inner.edited = None;
        inner.edited_version = None;
        if let Some(stored) = inner.stored.clone() {
            inner.yaml = Tracker::wrap(stored, self.0.hook.clone());
        }
    }

    fn discard(&self) {
        if let Some(collection) = self.collection() {
            collection.discard(self);
        }
        debug!(key = %self.key(), "discarded");
        self.notify();
    }

    fn start_write(&self, collection: &Collection, op: Op, doc: Json) -> Pending {
        let id = self.0.next_write.get() + 1;
        self.0.next_write.set(id);
        let (tx, pending) = Pending::channel();
        self.0.inner.borrow_mut().pending = Some(Write { id, op, tx });
        counter!("resync_writes_started_total", 1, "op" => op.as_str());
        self.transition(op.as_str());

        let weak = Rc::downgrade(&self.0);
        let done = Completion::new(move |result| {
            if let Some(cell) = weak.upgrade() {
                Record(cell).write_settled(id, result);
            }
        });
        let store = collection.store();
        match op {
            Op::Delete => store.delete(collection, doc, done),
            Op::Create | Op::Save => store.apply(collection, doc, done),
        }
        pending
    }

    fn write_settled(&self, id: u64, result: Result<(), StoreError>) {
        // Success is only an acknowledgement; the next load confirms it.
        let Err(err) = result else { return };
        let Some(write) = self.0.inner.borrow_mut().take_pending(id) else {
            return;
        };
        warn!(key = %self.key(), op = write.op.as_str(), error = %err, "write rejected");
        counter!("resync_writes_rejected_total", 1, "op" => write.op.as_str());
        if write.op == Op::Create {
            if let Some(collection) = self.collection() {
                collection.demote(self);
            }
        }
        self.refresh();
        let _ = write.tx.send(Err(err));
        self.notify();
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Rc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Record")
                .field("key", &inner.key.as_ref().unwrap_or(&self.0.draft))
                .field("state", &inner.state())
                .field("version", &inner.stored_version)
                .finish(),
            Err(_) => f.debug_struct("Record").field("key", &self.0.draft).finish_non_exhaustive(),
        }
    }
}
