//! Contracts for the external collaborators: the typed object store and the event sink.

use std::sync::Arc;

use async_trait::async_trait;
use craftop_schema::Minecraft;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::{DependentKind, ObjectKey};

/// Store failures. Absence on reads is reported as `Ok(None)`, never as `NotFound`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic-concurrency rejection: the write was based on a stale version.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    /// Transport failure, timeout or deadline expiry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
}

/// A fully-formed dependent manifest, one variant per managed kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Dependent {
    VolumeClaim(PersistentVolumeClaim),
    Config(ConfigMap),
    Workload(StatefulSet),
    NetworkEndpoint(Service),
}

impl Dependent {
    pub fn kind(&self) -> DependentKind {
        match self {
            Dependent::VolumeClaim(_) => DependentKind::VolumeClaim,
            Dependent::Config(_) => DependentKind::Config,
            Dependent::Workload(_) => DependentKind::Workload,
            Dependent::NetworkEndpoint(_) => DependentKind::NetworkEndpoint,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Dependent::VolumeClaim(o) => &o.metadata,
            Dependent::Config(o) => &o.metadata,
            Dependent::Workload(o) => &o.metadata,
            Dependent::NetworkEndpoint(o) => &o.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Dependent::VolumeClaim(o) => &mut o.metadata,
            Dependent::Config(o) => &mut o.metadata,
            Dependent::Workload(o) => &mut o.metadata,
            Dependent::NetworkEndpoint(o) => &mut o.metadata,
        }
    }

    pub fn key(&self) -> Option<ObjectKey> { ObjectKey::of(self.metadata()) }

    /// Uid of the controlling owner, if the manifest carries one.
    pub fn controller_uid(&self) -> Option<&str> {
        self.metadata()
            .owner_references
            .as_ref()?
            .iter()
            .find(|r| r.controller == Some(true))
            .map(|r| r.uid.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Normal,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "Normal",
            Severity::Warning => "Warning",
        }
    }
}

/// Typed CRUD over the parent kind and its dependents.
///
/// `update_parent` writes metadata and spec, `update_parent_status` writes
/// only status; both reject a stale `resourceVersion` with `Conflict` and
/// return the object as persisted.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_parent(&self, key: &ObjectKey) -> Result<Option<Minecraft>, StoreError>;
    async fn update_parent(&self, parent: &Minecraft) -> Result<Minecraft, StoreError>;
    async fn update_parent_status(&self, parent: &Minecraft) -> Result<Minecraft, StoreError>;
    async fn get_dependent(&self, kind: DependentKind, key: &ObjectKey) -> Result<Option<Dependent>, StoreError>;
    async fn create_dependent(&self, dependent: &Dependent) -> Result<(), StoreError>;
}

/// Fire-and-forget observability events attached to a parent.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, parent: &Minecraft, severity: Severity, reason: &str, message: &str);
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn get_parent(&self, key: &ObjectKey) -> Result<Option<Minecraft>, StoreError> {
        (**self).get_parent(key).await
    }
    async fn update_parent(&self, parent: &Minecraft) -> Result<Minecraft, StoreError> {
        (**self).update_parent(parent).await
    }
    async fn update_parent_status(&self, parent: &Minecraft) -> Result<Minecraft, StoreError> {
        (**self).update_parent_status(parent).await
    }
    async fn get_dependent(&self, kind: DependentKind, key: &ObjectKey) -> Result<Option<Dependent>, StoreError> {
        (**self).get_dependent(kind, key).await
    }
    async fn create_dependent(&self, dependent: &Dependent) -> Result<(), StoreError> {
        (**self).create_dependent(dependent).await
    }
}

#[async_trait]
impl<T: EventRecorder + ?Sized> EventRecorder for Arc<T> {
    async fn record(&self, parent: &Minecraft, severity: Severity, reason: &str, message: &str) {
        (**self).record(parent, severity, reason, message).await
    }
}
