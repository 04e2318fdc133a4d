use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;
use resync_store::{
    Collection, CollectionEvent, CowError, Json, Kind, KindRegistry, MemoryStore, Record, ResourceKey, State,
    Tracker,
};
use rustc_hash::FxHashSet;
use serde_json::json;

struct Mapping;

impl Kind for Mapping {
    fn name(&self) -> &str {
        "Mapping"
    }

    fn default_document(&self) -> Json {
        json!({"kind": "Mapping", "metadata": {"name": "", "namespace": "default"}, "spec": {"prefix": "/"}})
    }

    fn validate(&self, yaml: &Tracker) -> Vec<(String, String)> {
        match yaml.pointer(&["spec", "prefix"]).and_then(|n| n.as_str()) {
            Some(p) if p.starts_with('/') => Vec::new(),
            _ => vec![("spec.prefix".to_owned(), "prefix must start with /".to_owned())],
        }
    }
}

fn store() -> Rc<MemoryStore> {
    let mut kinds = KindRegistry::new();
    kinds.register(Mapping).unwrap();
    Rc::new(MemoryStore::with_kinds(kinds))
}

fn collection() -> (Rc<MemoryStore>, Collection) {
    let s = store();
    let c = Collection::new(s.clone());
    c.subscribe();
    (s, c)
}

fn gen(i: usize) -> Json {
    json!({"kind": "Host", "metadata": {"name": format!("host-{i}"), "namespace": "default"}})
}

fn sorted_keys<'a>(keys: impl IntoIterator<Item = &'a ResourceKey>) -> Vec<String> {
    let mut v: Vec<String> = keys.into_iter().map(ToString::to_string).collect();
    v.sort();
    v
}

#[test]
fn create_returns_a_fresh_unique_draft() {
    let (_s, c) = collection();
    let r = c.create("Host");
    assert!(r.is_new());
    assert!(!r.is_pending());
    let other = c.create("Host");
    assert_ne!(r, other);
    assert_ne!(r.key(), other.key());
    assert!(r.key().is_draft());
    assert!(c.contains(&r));
    assert!(c.records().contains(&r));
    assert_eq!(c.len(), 2);
}

#[test]
fn create_uses_the_registered_kind() {
    let (_s, c) = collection();
    let r = c.create("Mapping");
    assert_eq!(r.kind(), "Mapping");
    assert_eq!(r.yaml().pointer(&["spec", "prefix"]).and_then(|n| n.as_str()), Some("/"));
    r.update_yaml(|y| y.set_path(&["spec", "prefix"], json!("api"))).unwrap();
    assert_eq!(r.validate().get("spec.prefix").map(String::as_str), Some("prefix must start with /"));
}

#[test]
fn draft_key_solidifies_on_save() {
    let (s, c) = collection();
    let r = c.create("kind");
    let y = json!({"kind": "kind", "metadata": {"name": "bob", "namespace": "space"}});
    r.replace_yaml(y.clone()).unwrap();
    let p = r.save().unwrap();
    s.settle();
    assert!(matches!(p.now_or_never(), Some(Ok(()))));
    assert_eq!(r.key(), ResourceKey::of(&y));
    assert_eq!(r.key().as_str(), "kind::bob::space");
}

#[test]
fn second_draft_with_a_taken_key_is_refused() {
    let (_s, c) = collection();
    let first = c.create("Host");
    let second = c.create("Host");
    first.replace_yaml(gen(1)).unwrap();
    second.replace_yaml(gen(1)).unwrap();
    let _p = first.save().unwrap();
    let err = second.save().unwrap_err();
    assert_eq!(err, resync_store::LifecycleError::KeyTaken(ResourceKey::of(&gen(1))));
    assert_eq!(second.state(), State::New);
    assert!(!second.is_pending());
}

#[test]
fn load_returns_stored_read_only_records() {
    let (_s, c) = collection();
    let r = c.load(json!({"kind": "Resource", "metadata": {"name": "foo", "namespace": "bar"}}));
    assert!(!r.is_modified());
    assert!(r.is_read_only());
    assert_eq!(r.update_yaml(|y| y.set("foo", json!("bar"))), Err(CowError::ReadOnly));
    assert!(c.contains(&r));
    assert!(c.records().contains(&r));

    let m = c.load(json!({"kind": "Mapping", "metadata": {"name": "foo", "namespace": "bar"}}));
    assert_eq!(m.kind(), "Mapping");
}

#[test]
fn load_round_trips_documents() {
    let (_s, c) = collection();
    let y = json!({
        "kind": "Mapping",
        "metadata": {"name": "api", "namespace": "prod", "labels": {"team": "edge"}},
        "spec": {"prefix": "/api/", "weights": [1, 2.5, null], "tls": true}
    });
    let r = c.load(y.clone());
    assert_eq!(r.value(), y);
    assert_eq!(*r.stored_yaml().unwrap(), y);
}

#[test]
fn load_is_an_upsert_by_identity() {
    let (_s, c) = collection();
    let a = c.load(gen(1));
    let b = c.load(gen(1));
    assert_eq!(a, b);
    assert_eq!(c.len(), 1);
}

#[test]
fn iteration_puts_drafts_first_then_insertion_order() {
    let (_s, c) = collection();
    let n1 = c.create("Host");
    let n2 = c.create("Host");
    assert_eq!(c.records(), vec![n1.clone(), n2.clone()]);
    let r1 = c.load(gen(2));
    let r2 = c.load(gen(1));
    assert_eq!(c.records(), vec![n1.clone(), n2.clone(), r1.clone(), r2.clone()]);

    r2.edit().unwrap();
    r1.edit().unwrap();
    assert_eq!(c.records(), vec![n1.clone(), n2.clone(), r1.clone(), r2.clone()]);

    // Both vanish remotely while edited: they stay, in place, as zombies.
    c.intersect(&FxHashSet::default());
    let iterated: Vec<Record> = (&c).into_iter().collect();
    assert_eq!(iterated, vec![n1, n2, r1.clone(), r2.clone()]);
    assert_eq!(r1.state(), State::Zombie);
    assert_eq!(r2.state(), State::Zombie);
}

#[test]
fn pending_deletes_stay_listed() {
    let (_s, c) = collection();
    let n1 = c.create("Host");
    let n2 = c.create("Host");
    let r1 = c.load(gen(1));
    let r2 = c.load(gen(2));
    r2.delete().unwrap();
    let _p = r2.save().unwrap();
    assert!(r2.is_pending());
    assert_eq!(r2.state(), State::PendingDelete);
    let mut seen = Vec::new();
    for r in &c {
        seen.push(r);
    }
    assert_eq!(seen, vec![n1, n2, r1, r2]);
}

#[test]
fn intersect_keeps_only_listed_keys() {
    let (_s, c) = collection();
    let r1 = c.load(gen(1));
    let _r2 = c.load(gen(2));
    let n = c.create("Host");
    let keys: FxHashSet<ResourceKey> = [r1.key()].into_iter().collect();
    assert_eq!(c.intersect(&keys), 1);
    assert_eq!(c.records(), vec![n, r1]);
}

#[test]
fn intersect_drops_many_at_once_and_keeps_survivor_order() {
    let (_s, c) = collection();
    let records: Vec<Record> = (0..500).map(|i| c.load(gen(i))).collect();
    let removed = Rc::new(RefCell::new(0usize));
    let r = removed.clone();
    c.add_listener(move |ev| {
        if let CollectionEvent::Removed(_) = ev {
            *r.borrow_mut() += 1;
        }
    });
    let kept: Vec<Record> = records.iter().step_by(7).cloned().collect();
    let keys: FxHashSet<ResourceKey> = kept.iter().map(Record::key).collect();
    assert_eq!(c.intersect(&keys), 500 - kept.len());
    assert_eq!(*removed.borrow(), 500 - kept.len());
    assert_eq!(c.records(), kept);
    assert!(records.iter().step_by(7).all(|r| c.get(&r.key()).is_some()));
    assert!(c.get(&records[1].key()).is_none());
}

#[test]
fn reconcile_loads_then_intersects() {
    let (_s, c) = collection();
    let yamls: Vec<Json> = (0..4).map(gen).collect();
    let check = |batch: &[Json]| {
        c.reconcile(batch.iter().cloned());
        let listed: Vec<ResourceKey> = batch.iter().map(ResourceKey::of).collect();
        let held: Vec<ResourceKey> = c.records().iter().map(Record::key).collect();
        assert_eq!(sorted_keys(&held), sorted_keys(&listed));
    };
    check(&yamls);
    check(&yamls[..3]);
    check(&yamls[..2]);
    check(&yamls[1..]);
    check(&yamls[2..]);
    check(&yamls);
}

#[test]
fn reconcile_survives_pending_creates() {
    let (s, c) = collection();
    let n = c.create("Host");
    n.replace_yaml(gen(7)).unwrap();
    let p = n.save().unwrap();
    // A listing taken before the write landed must not drop the draft.
    s.poll();
    assert!(c.contains(&n));
    assert_eq!(n.state(), State::PendingCreate);
    s.settle();
    assert!(matches!(p.now_or_never(), Some(Ok(()))));
    assert_eq!(n.state(), State::Stored);
}

#[test]
fn failed_create_returns_to_its_draft_position() {
    let s = Rc::new(MemoryStore::failing("nope"));
    let c = Collection::new(s.clone());
    let n1 = c.create("Host");
    let n2 = c.create("Host");
    let n3 = c.create("Host");
    n2.replace_yaml(gen(1)).unwrap();
    let p = n2.save().unwrap();
    assert_eq!(c.records(), vec![n1.clone(), n3.clone(), n2.clone()]);
    s.process();
    assert!(p.now_or_never().unwrap().is_err());
    assert_eq!(c.records(), vec![n1, n2, n3]);
}

#[test]
fn events_are_published() {
    let (s, c) = collection();
    let events = Rc::new(RefCell::new(Vec::new()));
    let e = events.clone();
    let id = c.add_listener(move |ev| {
        e.borrow_mut().push(match ev {
            CollectionEvent::Added(r) => format!("added {}", r.kind()),
            CollectionEvent::Removed(r) => format!("removed {}", r.kind()),
            CollectionEvent::Reconciled { loaded, removed } => format!("reconciled {loaded}/{removed}"),
        })
    });
    let n = c.create("Mapping");
    n.cancel().unwrap();
    s.seed(gen(1));
    s.poll();
    s.remove(&ResourceKey::of(&gen(1)));
    s.poll();
    assert!(c.remove_listener(id));
    c.create("Host");
    assert_eq!(
        *events.borrow(),
        vec!["added Mapping", "removed Mapping", "added Host", "reconciled 1/0", "removed Host", "reconciled 0/1"]
    );
}

#[test]
fn weak_handles_do_not_keep_collections_alive() {
    let (s, c) = collection();
    let weak = c.downgrade();
    assert!(weak.upgrade().is_some());
    drop(c);
    assert!(weak.upgrade().is_none());
    // Polling a store whose subscriber is gone is a no-op.
    s.poll();
}

#[test]
fn records_outlive_their_collection_but_cannot_save() {
    let (_s, c) = collection();
    let n = c.create("Host");
    drop(c);
    assert_eq!(n.save().unwrap_err(), resync_store::LifecycleError::Detached);
}
