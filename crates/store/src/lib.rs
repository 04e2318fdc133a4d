//! resync store: per-record lifecycle, identity-keyed collection, and the
//! seam to the remote authority that owns the records.
//!
//! Everything here is single-threaded (`Rc`/`RefCell`). The only asynchrony is
//! the [`Pending`] future returned by [`Record::save`], which settles when the
//! [`Store`] reports back through a [`Completion`] or when a later
//! reconciliation confirms the write.

#![forbid(unsafe_code)]

use std::fmt;

mod collection;
mod kind;
mod memory;
mod pending;
mod record;

pub use collection::{Collection, CollectionEvent, WeakCollection};
pub use kind::{GenericKind, Kind, KindRegistry, RegistryError};
pub use memory::MemoryStore;
pub use pending::Pending;
pub use record::{LifecycleError, Record, RecordSummary, State};
pub use resync_core::{Json, ListenerId, ResourceKey};
pub use resync_cow::{CowError, Node, Tracker};

/// Failure of a remote write, delivered through [`Pending`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rejected by store: {0}")]
    Rejected(String),
    #[error("{0} not found")]
    NotFound(ResourceKey),
    #[error("store dropped the request without completing it")]
    Abandoned,
    #[error("encode: {0}")]
    Encode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The remote authority for a collection's records.
///
/// `apply` and `delete` start I/O and report the outcome through `done`,
/// possibly before returning. A successful completion is only an
/// acknowledgement; the record settles once a reconciliation reflects the
/// write. `subscribe` starts whatever loop feeds
/// [`Collection::reconcile`].
pub trait Store {
    fn kinds(&self) -> &KindRegistry;

    /// Construct an unsaved record of `kind` bound to `collection`.
    fn instantiate(&self, collection: &Collection, kind: &str) -> Record {
        Record::new(collection, self.kinds().resolve(kind))
    }

    /// Create-or-update. Server-managed fields must be stripped before
    /// they are persisted.
    fn apply(&self, collection: &Collection, yaml: Json, done: Completion);

    /// Delete the object identified by the document's kind, name and namespace.
    fn delete(&self, collection: &Collection, yaml: Json, done: Completion);

    fn subscribe(&self, collection: &Collection);
}

type Callback = Box<dyn FnOnce(Result<(), StoreError>)>;

/// One-shot outcome callback for a store request.
///
/// Dropping it without calling [`Completion::complete`] reports
/// [`StoreError::Abandoned`].
pub struct Completion {
    callback: Option<Callback>,
}

impl Completion {
    pub fn new(f: impl FnOnce(Result<(), StoreError>) + 'static) -> Self {
        Self { callback: Some(Box::new(f)) }
    }

    pub fn complete(mut self, result: Result<(), StoreError>) {
        if let Some(f) = self.callback.take() {
            f(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(f) = self.callback.take() {
            f(Err(StoreError::Abandoned));
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("armed", &self.callback.is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn completion_reports_once() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let done = Completion::new(move |r| s.borrow_mut().push(r.is_ok()));
        done.complete(Ok(()));
        assert_eq!(*seen.borrow(), vec![true]);
    }

    #[test]
    fn dropped_completion_is_abandoned() {
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        drop(Completion::new(move |r| *s.borrow_mut() = Some(r)));
        assert!(matches!(seen.borrow_mut().take(), Some(Err(StoreError::Abandoned))));
    }
}
