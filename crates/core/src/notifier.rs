//! Minimal synchronous publish/subscribe.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

/// Handle returned by [`Notifier::add_listener`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Rc<dyn Fn(&E)>;

/// Listeners are called in registration order, on the notifying thread,
/// before `notify` returns.
pub struct Notifier<E> {
    next_id: Cell<u64>,
    listeners: RefCell<SmallVec<[(ListenerId, Listener<E>); 4]>>,
}

impl<E> Notifier<E> {
    pub fn new() -> Self {
        Self { next_id: Cell::new(0), listeners: RefCell::new(SmallVec::new()) }
    }

    pub fn add_listener(&self, f: impl Fn(&E) + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners.borrow_mut().push((id, Rc::new(f)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn notify(&self, event: &E) {
        // Dispatch from a snapshot so listeners may (un)register without a RefCell clash.
        let snapshot: SmallVec<[Listener<E>; 4]> =
            self.listeners.borrow().iter().map(|(_, f)| Rc::clone(f)).collect();
        for f in snapshot {
            f(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Notifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Notifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").field("listeners", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_in_registration_order() {
        let n: Notifier<u32> = Notifier::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            n.add_listener(move |v: &u32| seen.borrow_mut().push(format!("{tag}{v}")));
        }
        n.notify(&7);
        assert_eq!(*seen.borrow(), vec!["a7", "b7", "c7"]);
    }

    #[test]
    fn removed_listeners_are_not_called() {
        let n: Notifier<()> = Notifier::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let id = n.add_listener(move |_| h.set(h.get() + 1));
        n.notify(&());
        assert!(n.remove_listener(id));
        assert!(!n.remove_listener(id));
        n.notify(&());
        assert_eq!(hits.get(), 1);
        assert!(n.is_empty());
    }

    #[test]
    fn listener_may_register_during_dispatch() {
        let n: Rc<Notifier<()>> = Rc::new(Notifier::new());
        let inner = n.clone();
        n.add_listener(move |_| {
            inner.add_listener(|_| {});
        });
        n.notify(&());
        assert_eq!(n.len(), 2);
    }
}
