//! Craftop core types shared by the synthesizers, stores and the reconcile loop.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

pub mod conditions;
pub mod finalizer;
pub mod store;

pub use store::{Dependent, EventRecorder, Severity, StateStore, StoreError};

pub mod prelude {
    pub use super::{DependentKind, Directive, ObjectKey};
    pub use super::store::{Dependent, EventRecorder, Severity, StateStore, StoreError};
}

/// Namespace-qualified identity of an object. Immutable once the object exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of a namespaced object; `None` when name or namespace is missing.
    pub fn of(meta: &ObjectMeta) -> Option<Self> {
        Some(Self { namespace: meta.namespace.clone()?, name: meta.name.clone()? })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Outcome of one reconcile pass, handed back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Nothing left to do until the next change notification.
    Stop,
    RequeueImmediate,
    RequeueAfter(Duration),
}

impl Directive {
    pub fn is_requeue(&self) -> bool { !matches!(self, Directive::Stop) }
}

/// The dependent resources managed on behalf of a parent, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DependentKind {
    VolumeClaim,
    Config,
    Workload,
    NetworkEndpoint,
}

impl DependentKind {
    /// Dependency order: each kind may only be created once all earlier kinds exist.
    pub const ORDER: [DependentKind; 4] = [
        DependentKind::VolumeClaim,
        DependentKind::Config,
        DependentKind::Workload,
        DependentKind::NetworkEndpoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DependentKind::VolumeClaim => "volume-claim",
            DependentKind::Config => "config",
            DependentKind::Workload => "workload",
            DependentKind::NetworkEndpoint => "network-endpoint",
        }
    }

    /// Kubernetes kind backing this dependent.
    pub fn k8s_kind(&self) -> &'static str {
        match self {
            DependentKind::VolumeClaim => "PersistentVolumeClaim",
            DependentKind::Config => "ConfigMap",
            DependentKind::Workload => "StatefulSet",
            DependentKind::NetworkEndpoint => "Service",
        }
    }
}

impl fmt::Display for DependentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}
