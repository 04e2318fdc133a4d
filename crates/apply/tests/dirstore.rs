use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use resync_apply::{ApplyConfig, DirStore};
use resync_store::{Collection, ResourceKey, State, StoreError};
use serde_json::json;
use tokio::task::LocalSet;
use tokio::time::{sleep, timeout};

fn temp_root(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    std::env::temp_dir().join(format!("resync-test-{tag}-{nanos}"))
}

fn fast() -> ApplyConfig {
    ApplyConfig::default().with_poll_interval(Duration::from_millis(20))
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn create_edit_delete_through_the_directory() {
    let root = temp_root("lifecycle");
    let dir = root.clone();
    LocalSet::new()
        .run_until(async move {
            let store = DirStore::new(&dir, fast());
            let c = Collection::new(Rc::new(store.clone()));
            c.subscribe();

            let n = c.create("Host");
            n.replace_yaml(json!({
                "kind": "Host",
                "metadata": {"name": "web", "namespace": "default"},
                "spec": {"hostname": "web.example.com"}
            }))
            .unwrap();
            let p = n.save().unwrap();
            assert_eq!(n.state(), State::PendingCreate);
            timeout(WAIT, p).await.expect("create confirmed").unwrap();
            assert_eq!(n.state(), State::Stored);

            let path = dir.join("default").join("Host").join("web.yaml");
            assert!(path.exists());
            let first = n.stored_yaml().unwrap();
            assert_eq!(first["metadata"]["generation"], json!(1));
            let uid = first["metadata"]["uid"].clone();
            assert!(uid.is_string());

            n.edit().unwrap();
            n.update_yaml(|y| y.set_path(&["spec", "port"], json!(8080))).unwrap();
            timeout(WAIT, n.save().unwrap()).await.expect("save confirmed").unwrap();
            assert_eq!(n.state(), State::Stored);
            let second = n.stored_yaml().unwrap();
            assert_eq!(second["spec"]["port"], json!(8080));
            assert_eq!(second["metadata"]["generation"], json!(2));
            assert_eq!(second["metadata"]["uid"], uid);

            n.delete().unwrap();
            timeout(WAIT, n.save().unwrap()).await.expect("delete confirmed").unwrap();
            assert!(!c.contains(&n));
            assert!(!path.exists());
        })
        .await;
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn external_files_are_picked_up_and_bad_ones_skipped() {
    let root = temp_root("external");
    let dir = root.clone();
    LocalSet::new()
        .run_until(async move {
            let hosts = dir.join("prod").join("Host");
            std::fs::create_dir_all(&hosts).unwrap();
            std::fs::write(hosts.join("api.yaml"), "kind: Host\nmetadata:\n  name: api\n  namespace: prod\n").unwrap();
            std::fs::write(hosts.join("broken.yaml"), "kind: [oops\n").unwrap();
            std::fs::write(hosts.join("notes.txt"), "not a document").unwrap();

            let store = DirStore::new(&dir, fast());
            assert_eq!(store.list().await.unwrap().len(), 1);

            let c = Collection::new(Rc::new(store.clone()));
            c.subscribe();
            let key = ResourceKey::new("Host", "api", "prod");
            let found = timeout(WAIT, async {
                loop {
                    if let Some(r) = c.get(&key) {
                        return r;
                    }
                    sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("listed");
            assert_eq!(found.state(), State::Stored);

            // Someone else deletes the file while we edit: the record turns zombie.
            found.edit().unwrap();
            std::fs::remove_file(hosts.join("api.yaml")).unwrap();
            timeout(WAIT, async {
                while found.state() != State::Zombie {
                    sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("zombie");
            assert!(c.contains(&found));
        })
        .await;
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn unsafe_names_are_rejected_by_the_store() {
    let root = temp_root("unsafe");
    let dir = root.clone();
    LocalSet::new()
        .run_until(async move {
            let c = Collection::new(Rc::new(DirStore::new(&dir, fast())));
            let n = c.create("Host");
            n.update_yaml(|y| y.set_path(&["metadata", "name"], json!("../escape"))).unwrap();
            let err = timeout(WAIT, n.save().unwrap()).await.expect("settled").unwrap_err();
            assert!(matches!(err, StoreError::Rejected(_)), "{err}");
            assert_eq!(n.state(), State::New);
            assert!(n.key().is_draft());
        })
        .await;
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn listings_follow_file_locations() {
    let root = temp_root("placement");
    let dir = root.clone();
    LocalSet::new()
        .run_until(async move {
            let hosts = dir.join("prod").join("Host");
            std::fs::create_dir_all(&hosts).unwrap();
            std::fs::write(hosts.join("api.yaml"), "kind: Host\nmetadata:\n  name: api\n").unwrap();
            std::fs::write(hosts.join("stray.yaml"), "kind: Host\nmetadata:\n  name: other\n  namespace: prod\n")
                .unwrap();

            let store = DirStore::new(&dir, fast());
            let docs = store.list().await.unwrap();
            assert_eq!(docs.len(), 1, "{docs:?}");
            assert_eq!(ResourceKey::of(&docs[0]), ResourceKey::new("Host", "api", "prod"));

            let c = Collection::new(Rc::new(store.clone()));
            c.reconcile(docs);
            c.subscribe();
            let api = c.get(&ResourceKey::new("Host", "api", "prod")).expect("listed under its directory");
            api.delete().unwrap();
            timeout(WAIT, api.save().unwrap()).await.expect("delete confirmed").unwrap();
            assert!(!c.contains(&api));
            assert!(!hosts.join("api.yaml").exists());
            assert!(c.get(&ResourceKey::new("Host", "other", "prod")).is_none());
        })
        .await;
    let _ = std::fs::remove_dir_all(&root);
}
