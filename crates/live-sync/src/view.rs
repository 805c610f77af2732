//! Client-side mirror of server state with optimistic patches on top.
//!
//! Paths are JSON pointers (`/resources/gold`). Authoritative snapshots
//! replace the base; outstanding optimistic patches are re-applied over the
//! new base until their command resolves.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

pub type PatchId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub path: String,
    pub value: Value,
}

/// A set of guessed field values produced by an optimistic transform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    changes: Vec<FieldChange>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.changes.push(FieldChange {
            path: path.into(),
            value,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[FieldChange] {
        &self.changes
    }
}

struct Inner {
    /// Last authoritative state: snapshots, merged fragments and confirmed
    /// patches.
    base: Value,
    /// `base` with every pending patch applied in id order.
    state: Value,
    pending: BTreeMap<PatchId, Patch>,
    next_id: PatchId,
}

impl Inner {
    fn rebuild(&mut self) {
        let mut state = self.base.clone();
        for patch in self.pending.values() {
            write_patch(&mut state, patch);
        }
        self.state = state;
    }
}

#[derive(Clone)]
pub struct LocalView {
    inner: Arc<Mutex<Inner>>,
    version: Arc<watch::Sender<u64>>,
}

impl Default for LocalView {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl LocalView {
    pub fn new(initial: Value) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                base: initial.clone(),
                state: initial,
                pending: BTreeMap::new(),
                next_id: 1,
            })),
            version: Arc::new(version),
        }
    }

    pub fn snapshot(&self) -> Value {
        self.inner.lock().state.clone()
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.inner.lock().state.pointer(path).cloned()
    }

    pub fn pending_patches(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Bumps on every visible change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn apply(&self, patch: Patch) -> PatchId {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            // Newest id, so applying on top equals a rebuild.
            write_patch(&mut inner.state, &patch);
            inner.pending.insert(id, patch);
            id
        };
        debug!(target = "sync.view", patch = id, "optimistic patch applied");
        self.bump();
        id
    }

    /// Drops a patch and rebuilds the view from the authoritative base and
    /// the patches still pending.
    pub fn rollback(&self, id: PatchId) -> bool {
        let reverted = {
            let mut inner = self.inner.lock();
            let reverted = inner.pending.remove(&id).is_some();
            if reverted {
                inner.rebuild();
            }
            reverted
        };
        if reverted {
            debug!(target = "sync.view", patch = id, "optimistic patch rolled back");
            self.bump();
        }
        reverted
    }

    /// Confirms a patch. Its guesses become part of the base until the next
    /// snapshot; the server fragment, when present, overwrites them.
    pub fn reconcile(&self, id: PatchId, fragment: Option<&Value>) {
        {
            let mut inner = self.inner.lock();
            if let Some(patch) = inner.pending.remove(&id) {
                write_patch(&mut inner.base, &patch);
            }
            if let Some(fragment) = fragment {
                merge(&mut inner.base, fragment);
            }
            inner.rebuild();
        }
        debug!(target = "sync.view", patch = id, "optimistic patch confirmed");
        self.bump();
    }

    /// Merges a server fragment outside of any command. Pending patches stay
    /// on top.
    pub fn merge(&self, fragment: &Value) {
        {
            let mut inner = self.inner.lock();
            merge(&mut inner.base, fragment);
            inner.rebuild();
        }
        self.bump();
    }

    /// Installs a new authoritative base and re-applies outstanding patches.
    pub fn replace(&self, base: Value) {
        {
            let mut inner = self.inner.lock();
            inner.base = base;
            inner.rebuild();
        }
        self.bump();
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version += 1);
    }
}

fn write_patch(state: &mut Value, patch: &Patch) {
    for change in &patch.changes {
        // Only field pointers; "" or "gold" would clobber the whole document.
        if !change.path.starts_with('/') {
            warn!(
                target = "sync.view",
                path = %change.path,
                "ignoring patch path that is not a JSON pointer"
            );
            continue;
        }
        set_path(state, &change.path, change.value.clone());
    }
}

fn split_pointer(path: &str) -> Vec<String> {
    path.split('/')
        .skip(1)
        .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
        .collect()
}

fn set_path(state: &mut Value, path: &str, value: Value) {
    let segments = split_pointer(path);
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut cursor = state;
    for segment in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        cursor = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    match cursor {
        Value::Object(map) => {
            map.insert(last.clone(), value);
        }
        Value::Array(items) => {
            if let Some(slot) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *slot = value;
            }
        }
        other => {
            let mut map = Map::new();
            map.insert(last.clone(), value);
            *other = Value::Object(map);
        }
    }
}

fn merge(target: &mut Value, fragment: &Value) {
    match (target, fragment) {
        (Value::Object(target), Value::Object(fragment)) => {
            for (key, value) in fragment {
                match target.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, fragment) => *target = fragment.clone(),
    }
}
