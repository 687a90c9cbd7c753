//! Craftop store: in-RAM object store with API-server-like write semantics.
//!
//! Used as the backing store for tests and local runs. Writes are checked
//! against `resourceVersion`, deletion is gated on finalizers, and physical
//! removal of a parent cascades to every dependent it controls. Every call
//! is journaled in order, and any operation can be made to fail once.

#![forbid(unsafe_code)]

use std::collections::VecDeque;

use async_trait::async_trait;
use craftop_core::{Dependent, DependentKind, EventRecorder, ObjectKey, Severity, StateStore, StoreError};
use craftop_schema::Minecraft;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const NOTIFY_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetParent,
    UpdateParent,
    UpdateStatus,
    GetDependent,
    CreateDependent,
    RecordEvent,
}

impl Op {
    pub fn is_write(&self) -> bool {
        matches!(self, Op::UpdateParent | Op::UpdateStatus | Op::CreateDependent)
    }
}

/// One journaled call against the store.
#[derive(Debug, Clone)]
pub struct Call {
    pub op: Op,
    pub key: ObjectKey,
    pub kind: Option<DependentKind>,
    /// Set when the call was rejected.
    pub error: Option<StoreError>,
    /// Parent as persisted by a successful `UpdateParent` / `UpdateStatus`.
    pub written: Option<Minecraft>,
    /// `(severity, reason, message)` for `RecordEvent`.
    pub event: Option<(Severity, String, String)>,
}

impl Call {
    fn new(op: Op, key: ObjectKey) -> Self {
        Self { op, key, kind: None, error: None, written: None, event: None }
    }

    pub fn ok(&self) -> bool { self.error.is_none() }
}

#[derive(Default)]
struct Inner {
    parents: FxHashMap<ObjectKey, Minecraft>,
    dependents: FxHashMap<(DependentKind, ObjectKey), Dependent>,
    next_rv: u64,
    journal: Vec<Call>,
    faults: FxHashMap<Op, VecDeque<StoreError>>,
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn take_fault(&mut self, op: Op) -> Option<StoreError> {
        self.faults.get_mut(&op).and_then(|q| q.pop_front())
    }

    /// Remove a parent and every dependent it controls.
    fn purge(&mut self, key: &ObjectKey) {
        let Some(parent) = self.parents.remove(key) else { return };
        let uid = parent.metadata.uid.unwrap_or_default();
        let before = self.dependents.len();
        self.dependents.retain(|_, d| d.controller_uid() != Some(uid.as_str()));
        debug!(key = %key, cascaded = before - self.dependents.len(), "parent removed");
    }

    fn finalizers_empty(parent: &Minecraft) -> bool {
        parent.metadata.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true)
    }

    /// Key of the parent controlling `dep`, if it is still present.
    fn owner_key(&self, dep: &Dependent) -> Option<ObjectKey> {
        let uid = dep.controller_uid()?;
        self.parents
            .iter()
            .find(|(_, p)| p.metadata.uid.as_deref() == Some(uid))
            .map(|(k, _)| k.clone())
    }
}

/// In-RAM implementation of [`StateStore`] and [`EventRecorder`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    notify: broadcast::Sender<ObjectKey>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAP);
        Self { inner: Mutex::new(Inner::default()), notify }
    }

    /// Change notifications, keyed by parent identity.
    pub fn subscribe(&self) -> broadcast::Receiver<ObjectKey> { self.notify.subscribe() }

    fn emit(&self, key: ObjectKey) {
        // No receivers is fine.
        let _ = self.notify.send(key);
    }

    /// Create a parent as a user would, assigning uid, creation time and version.
    pub fn insert_parent(&self, mut parent: Minecraft) -> Result<Minecraft, StoreError> {
        let key = ObjectKey::of(&parent.metadata)
            .ok_or_else(|| StoreError::Invalid("parent needs name and namespace".into()))?;
        let mut inner = self.inner.lock();
        if inner.parents.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{} already exists", key)));
        }
        parent.metadata.uid = Some(Uuid::new_v4().to_string());
        parent.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        parent.metadata.deletion_timestamp = None;
        parent.metadata.resource_version = Some(inner.bump_rv());
        inner.parents.insert(key.clone(), parent.clone());
        drop(inner);
        self.emit(key);
        Ok(parent)
    }

    /// Request deletion: stamp the deletion marker, or remove at once when no finalizers remain.
    pub fn request_delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let rv = inner.bump_rv();
        let parent = inner.parents.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if Inner::finalizers_empty(parent) {
            inner.purge(key);
        } else if parent.metadata.deletion_timestamp.is_none() {
            parent.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            parent.metadata.resource_version = Some(rv);
        }
        drop(inner);
        self.emit(key.clone());
        Ok(())
    }

    /// Simulate another actor removing a dependent.
    pub fn delete_dependent(&self, kind: DependentKind, key: &ObjectKey) -> Option<Dependent> {
        let mut inner = self.inner.lock();
        let removed = inner.dependents.remove(&(kind, key.clone()))?;
        let owner = inner.owner_key(&removed);
        drop(inner);
        if let Some(owner) = owner { self.emit(owner); }
        Some(removed)
    }

    /// Simulate another actor writing the parent: only the version moves.
    pub fn touch_parent(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let rv = inner.bump_rv();
        let parent = inner.parents.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        parent.metadata.resource_version = Some(rv);
        drop(inner);
        self.emit(key.clone());
        Ok(())
    }

    /// Make the next call of `op` fail with `err`. Faults queue up per operation.
    pub fn fail_next(&self, op: Op, err: StoreError) {
        self.inner.lock().faults.entry(op).or_default().push_back(err);
    }

    pub fn parent(&self, key: &ObjectKey) -> Option<Minecraft> { self.inner.lock().parents.get(key).cloned() }

    pub fn dependent(&self, kind: DependentKind, key: &ObjectKey) -> Option<Dependent> {
        self.inner.lock().dependents.get(&(kind, key.clone())).cloned()
    }

    /// Kinds of the dependents present under `key`, in dependency order.
    pub fn dependent_kinds(&self, key: &ObjectKey) -> Vec<DependentKind> {
        let inner = self.inner.lock();
        DependentKind::ORDER.into_iter().filter(|k| inner.dependents.contains_key(&(*k, key.clone()))).collect()
    }

    pub fn journal(&self) -> Vec<Call> { self.inner.lock().journal.clone() }

    pub fn clear_journal(&self) { self.inner.lock().journal.clear(); }

    /// Number of successful writes journaled so far.
    pub fn write_count(&self) -> usize { self.inner.lock().journal.iter().filter(|c| c.op.is_write() && c.ok()).count() }

    /// Conditions as persisted by each successful status write for `key`, oldest first.
    pub fn status_history(&self, key: &ObjectKey) -> Vec<Vec<Condition>> {
        self.inner
            .lock()
            .journal
            .iter()
            .filter(|c| c.op == Op::UpdateStatus && c.ok() && &c.key == key)
            .filter_map(|c| c.written.as_ref().map(|p| p.conditions().to_vec()))
            .collect()
    }

    fn journal_call(&self, call: Call) { self.inner.lock().journal.push(call); }

    fn parent_key(parent: &Minecraft) -> Result<ObjectKey, StoreError> {
        ObjectKey::of(&parent.metadata).ok_or_else(|| StoreError::Invalid("parent needs name and namespace".into()))
    }

    /// Shared write path for parent updates; `apply` copies the allowed fields onto the stored object.
    fn write_parent(&self, op: Op, incoming: &Minecraft, apply: impl FnOnce(&mut Minecraft, &Minecraft)) -> Result<Minecraft, StoreError> {
        let key = Self::parent_key(incoming)?;
        let mut inner = self.inner.lock();
        let mut call = Call::new(op, key.clone());
        let result = (|| {
            if let Some(err) = inner.take_fault(op) { return Err(err); }
            let rv = inner.next_rv + 1;
            let stored = inner.parents.get_mut(&key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            if let Some(want) = incoming.metadata.resource_version.as_deref() {
                let have = stored.metadata.resource_version.as_deref().unwrap_or_default();
                if want != have {
                    return Err(StoreError::Conflict(format!("{} is at version {}, write was based on {}", key, have, want)));
                }
            }
            apply(stored, incoming);
            stored.metadata.resource_version = Some(rv.to_string());
            let persisted = stored.clone();
            inner.next_rv = rv;
            if persisted.metadata.deletion_timestamp.is_some() && Inner::finalizers_empty(&persisted) {
                inner.purge(&key);
            }
            Ok(persisted)
        })();
        match &result {
            Ok(p) => call.written = Some(p.clone()),
            Err(e) => call.error = Some(e.clone()),
        }
        inner.journal.push(call);
        drop(inner);
        if result.is_ok() { self.emit(key); }
        result
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_parent(&self, key: &ObjectKey) -> Result<Option<Minecraft>, StoreError> {
        let mut inner = self.inner.lock();
        let mut call = Call::new(Op::GetParent, key.clone());
        let result = match inner.take_fault(Op::GetParent) {
            Some(err) => Err(err),
            None => Ok(inner.parents.get(key).cloned()),
        };
        call.error = result.as_ref().err().cloned();
        inner.journal.push(call);
        result
    }

    async fn update_parent(&self, parent: &Minecraft) -> Result<Minecraft, StoreError> {
        self.write_parent(Op::UpdateParent, parent, |stored, incoming| {
            // Server-owned identity and deletion marker are never taken from the client.
            let uid = stored.metadata.uid.take();
            let created = stored.metadata.creation_timestamp.take();
            let deleting = stored.metadata.deletion_timestamp.take();
            stored.metadata = incoming.metadata.clone();
            stored.metadata.uid = uid;
            stored.metadata.creation_timestamp = created;
            stored.metadata.deletion_timestamp = deleting;
            stored.spec = incoming.spec.clone();
        })
    }

    async fn update_parent_status(&self, parent: &Minecraft) -> Result<Minecraft, StoreError> {
        self.write_parent(Op::UpdateStatus, parent, |stored, incoming| {
            stored.status = incoming.status.clone();
        })
    }

    async fn get_dependent(&self, kind: DependentKind, key: &ObjectKey) -> Result<Option<Dependent>, StoreError> {
        let mut inner = self.inner.lock();
        let mut call = Call::new(Op::GetDependent, key.clone());
        call.kind = Some(kind);
        let result = match inner.take_fault(Op::GetDependent) {
            Some(err) => Err(err),
            None => Ok(inner.dependents.get(&(kind, key.clone())).cloned()),
        };
        call.error = result.as_ref().err().cloned();
        inner.journal.push(call);
        result
    }

    async fn create_dependent(&self, dependent: &Dependent) -> Result<(), StoreError> {
        let kind = dependent.kind();
        let key = dependent
            .key()
            .ok_or_else(|| StoreError::Invalid(format!("{} needs name and namespace", kind.k8s_kind())))?;
        let mut inner = self.inner.lock();
        let mut call = Call::new(Op::CreateDependent, key.clone());
        call.kind = Some(kind);
        let result = (|| {
            if let Some(err) = inner.take_fault(Op::CreateDependent) { return Err(err); }
            if inner.dependents.contains_key(&(kind, key.clone())) {
                return Err(StoreError::Conflict(format!("{} {} already exists", kind.k8s_kind(), key)));
            }
            let mut stored = dependent.clone();
            let rv = inner.bump_rv();
            let meta = stored.metadata_mut();
            meta.uid = Some(Uuid::new_v4().to_string());
            meta.resource_version = Some(rv);
            meta.creation_timestamp = Some(Time(chrono::Utc::now()));
            let owner = inner.owner_key(&stored);
            inner.dependents.insert((kind, key.clone()), stored);
            Ok(owner)
        })();
        call.error = result.as_ref().err().cloned();
        inner.journal.push(call);
        drop(inner);
        let owner = result?;
        if let Some(owner) = owner { self.emit(owner); }
        Ok(())
    }
}

#[async_trait]
impl EventRecorder for MemoryStore {
    async fn record(&self, parent: &Minecraft, severity: Severity, reason: &str, message: &str) {
        let Some(key) = ObjectKey::of(&parent.metadata) else { return };
        let mut call = Call::new(Op::RecordEvent, key);
        call.event = Some((severity, reason.to_string(), message.to_string()));
        self.journal_call(call);
    }
}
