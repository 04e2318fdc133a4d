//! `DirStore`: `<root>/<namespace>/<kind>/<name>.yaml`, one document per file.

use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use metrics::{counter, histogram};
use resync_core::managed::strip_server_fields;
use resync_core::{str_at, Json, ResourceKey};
use resync_store::{Collection, Completion, KindRegistry, Store, StoreError};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::doc::{parse_document, render_document};
use crate::ApplyConfig;

/// A directory tree standing in for a remote API server.
///
/// Writes and the polling subscription run as `tokio` local tasks, so every
/// [`Store`] call must happen inside a [`tokio::task::LocalSet`].
#[derive(Clone)]
pub struct DirStore {
    inner: Rc<Shared>,
}

struct Shared {
    root: PathBuf,
    config: ApplyConfig,
    kinds: KindRegistry,
    /// Bumped after every successful write so pollers re-list right away.
    writes_tx: watch::Sender<u64>,
    writes_rx: watch::Receiver<u64>,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>, config: ApplyConfig) -> Self {
        Self::with_kinds(root, config, KindRegistry::new())
    }

    pub fn with_kinds(root: impl Into<PathBuf>, config: ApplyConfig, kinds: KindRegistry) -> Self {
        let (writes_tx, writes_rx) = watch::channel(0u64);
        Self { inner: Rc::new(Shared { root: root.into(), config, kinds, writes_tx, writes_rx }) }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn config(&self) -> &ApplyConfig {
        &self.inner.config
    }

    /// Every parsable document under the root, in path order. Files that
    /// fail to parse, exceed the YAML budgets, or name a different
    /// kind, name or namespace than their path are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<Json>> {
        self.inner.list().await
    }

    /// Where the document for `yaml` lives.
    pub fn path_for(&self, yaml: &Json) -> Result<PathBuf, StoreError> {
        self.inner.path_for(yaml)
    }
}

impl Shared {
    async fn list(&self) -> Result<Vec<Json>> {
        let started = Instant::now();
        let mut docs = Vec::new();
        for ns in entries(&self.root).await? {
            if !ns.is_dir {
                continue;
            }
            for kind in entries(&ns.path).await? {
                if !kind.is_dir {
                    continue;
                }
                for file in entries(&kind.path).await? {
                    if file.is_dir || !is_yaml(&file.path) {
                        continue;
                    }
                    let placed = self.read(&file.path).await.and_then(|mut doc| {
                        place(&mut doc, &file.path)?;
                        Ok(doc)
                    });
                    match placed {
                        Ok(doc) => docs.push(doc),
                        Err(e) => {
                            counter!("resync_dirstore_skipped_total", 1);
                            warn!(path = %file.path.display(), error = %format!("{e:#}"), "skipping document");
                        }
                    }
                }
            }
        }
        histogram!("resync_dirstore_poll_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(docs)
    }

    async fn read(&self, path: &Path) -> Result<Json> {
        let text = tokio::fs::read_to_string(path).await.with_context(|| format!("reading {}", path.display()))?;
        parse_document(&text, &self.config)
    }

    fn path_for(&self, yaml: &Json) -> Result<PathBuf, StoreError> {
        let kind = segment(str_at(yaml, &["kind"]))?;
        let name = segment(str_at(yaml, &["metadata", "name"]))?;
        let namespace = segment(str_at(yaml, &["metadata", "namespace"]))?;
        Ok(self.root.join(namespace).join(kind).join(format!("{name}.yaml")))
    }

    async fn write(&self, mut yaml: Json) -> Result<(), StoreError> {
        strip_server_fields(&mut yaml);
        let path = self.path_for(&yaml)?;
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(text) => parse_document(&text, &self.config).ok(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        stamp(&mut yaml, existing.as_ref());
        let text = render_document(&yaml).map_err(|e| StoreError::Encode(format!("{e:#}")))?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Write then rename so a concurrent listing never sees half a file.
        let tmp = path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "document written");
        Ok(())
    }

    async fn remove(&self, yaml: &Json) -> Result<(), StoreError> {
        let path = self.path_for(yaml)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "document removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(ResourceKey::of(yaml))),
            Err(e) => Err(e.into()),
        }
    }

    fn bump(&self) {
        let next = *self.writes_rx.borrow() + 1;
        let _ = self.writes_tx.send(next);
    }
}

impl Store for DirStore {
    fn kinds(&self) -> &KindRegistry {
        &self.inner.kinds
    }

    fn apply(&self, _collection: &Collection, yaml: Json, done: Completion) {
        let shared = Rc::clone(&self.inner);
        tokio::task::spawn_local(async move {
            let result = shared.write(yaml).await;
            if result.is_ok() {
                shared.bump();
            }
            done.complete(result);
        });
    }

    fn delete(&self, _collection: &Collection, yaml: Json, done: Completion) {
        let shared = Rc::clone(&self.inner);
        tokio::task::spawn_local(async move {
            let result = shared.remove(&yaml).await;
            if result.is_ok() {
                shared.bump();
            }
            done.complete(result);
        });
    }

    /// Poll on the configured interval and right after each successful
    /// write, until the collection is dropped.
    fn subscribe(&self, collection: &Collection) {
        let shared = Rc::clone(&self.inner);
        let weak = collection.downgrade();
        tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(shared.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut writes = shared.writes_rx.clone();
            info!(root = %shared.root.display(), interval_ms = shared.config.poll_interval.as_millis() as u64, "polling directory");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = writes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if weak.upgrade().is_none() {
                    break;
                }
                let docs = match shared.list().await {
                    Ok(docs) => docs,
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "listing failed");
                        continue;
                    }
                };
                match weak.upgrade() {
                    Some(collection) => collection.reconcile(docs),
                    None => break,
                }
            }
            debug!("directory poll loop stopped");
        });
    }
}

struct Entry {
    path: PathBuf,
    is_dir: bool,
}

/// Directory entries sorted by path; a missing directory is empty.
async fn entries(dir: &Path) -> Result<Vec<Entry>> {
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };
    let mut out = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        let is_dir = entry.file_type().await?.is_dir();
        out.push(Entry { path: entry.path(), is_dir });
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

fn is_yaml(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"))
}

fn segment(value: Option<&str>) -> Result<&str, StoreError> {
    match value {
        Some(s) if !s.is_empty() && !s.contains(|c| c == '/' || c == '\\') && !s.contains("..") => Ok(s),
        other => Err(StoreError::Rejected(format!("invalid path segment {:?}", other.unwrap_or_default()))),
    }
}

/// Make a listed document agree with where it lives, since writes and
/// deletes address it by path. A missing namespace is taken from the
/// directory; any other disagreement skips the file.
fn place(doc: &mut Json, path: &Path) -> Result<()> {
    let component = |p: Option<&Path>| p.and_then(|p| p.file_name()).and_then(|s| s.to_str()).map(str::to_owned);
    let kind_dir = path.parent();
    let ns_dir = kind_dir.and_then(Path::parent);
    let (Some(name), Some(kind), Some(namespace)) =
        (path.file_stem().and_then(|s| s.to_str()), component(kind_dir), component(ns_dir))
    else {
        return Err(anyhow!("not under <namespace>/<kind>/"));
    };
    if let Some(meta) = doc.get_mut("metadata").and_then(Value::as_object_mut) {
        if !meta.contains_key("namespace") {
            meta.insert("namespace".to_owned(), Value::String(namespace.clone()));
        }
    }
    let found = (str_at(doc, &["kind"]), str_at(doc, &["metadata", "name"]), str_at(doc, &["metadata", "namespace"]));
    if found != (Some(kind.as_str()), Some(name), Some(namespace.as_str())) {
        return Err(anyhow!(
            "document {} does not match its location {namespace}/{kind}/{name}",
            ResourceKey::of(doc)
        ));
    }
    Ok(())
}

/// Fill in what an API server would own: `uid` and `creationTimestamp`
/// survive from the previous version, `generation` counts applies.
fn stamp(yaml: &mut Json, existing: Option<&Json>) {
    let prev = |field: &str| existing.and_then(|e| e.get("metadata")).and_then(|m| m.get(field)).cloned();
    let uid = prev("uid").unwrap_or_else(|| Value::String(Uuid::new_v4().to_string()));
    let created = prev("creationTimestamp")
        .unwrap_or_else(|| Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)));
    let generation = prev("generation").and_then(|g| g.as_u64()).unwrap_or(0) + 1;
    if let Some(meta) = yaml.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert("uid".to_owned(), uid);
        meta.insert("creationTimestamp".to_owned(), created);
        meta.insert("generation".to_owned(), Value::from(generation));
    }
}
