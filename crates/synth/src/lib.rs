//! Craftop synthesizers: pure functions from a `Minecraft` object to the
//! manifests of its four dependents.
//!
//! Every manifest shares the parent's name and namespace, carries the common
//! label set and a controller owner reference back to the parent. Synthesis
//! is deterministic: the same parent and config always produce the same
//! manifest. Configuration is resolved once and injected at construction.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use craftop_core::{Dependent, DependentKind};
use craftop_schema::Minecraft;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;

mod config;
mod endpoint;
mod image;
mod volume;
mod workload;

pub use config::ConfigSynth;
pub use endpoint::{EndpointSynth, SERVER_PORT};
pub use image::ImageRef;
pub use volume::VolumeClaimSynth;
pub use workload::WorkloadSynth;

pub const DEFAULT_IMAGE: &str = "itzg/minecraft-server:latest";
pub const DEFAULT_STORAGE_SIZE: &str = "2Gi";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("image reference {0:?} cannot be resolved: {1}")]
    ImageUnresolved(String, &'static str),
    #[error("storage size must not be empty")]
    EmptyStorageSize,
    /// The parent has no uid/name yet, so no owner reference can be built.
    #[error("cannot build owner reference: parent {0} has no uid")]
    MissingOwnerIdentity(String),
    #[error("parent {0} has no namespace")]
    MissingNamespace(String),
}

/// External configuration consumed by the synthesizers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthConfig {
    /// Server image reference, e.g. `itzg/minecraft-server:java21`.
    pub image: String,
    /// Storage request for the volume claim, as a Kubernetes quantity.
    pub storage_size: String,
    /// When set, services are annotated for mc-router as `<name>.<domain>`.
    pub external_domain: Option<String>,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self { image: DEFAULT_IMAGE.to_string(), storage_size: DEFAULT_STORAGE_SIZE.to_string(), external_domain: None }
    }
}

/// Builds one dependent kind from a parent.
pub trait Synthesizer: Send + Sync {
    fn kind(&self) -> DependentKind;
    fn synthesize(&self, parent: &Minecraft) -> Result<Dependent, SynthesisError>;
}

/// The four synthesizers in dependency order.
pub fn standard(cfg: SynthConfig) -> Vec<Box<dyn Synthesizer>> {
    let cfg = Arc::new(cfg);
    vec![
        Box::new(VolumeClaimSynth::new(Arc::clone(&cfg))),
        Box::new(ConfigSynth::new(Arc::clone(&cfg))),
        Box::new(WorkloadSynth::new(Arc::clone(&cfg))),
        Box::new(EndpointSynth::new(cfg)),
    ]
}

/// Selector labels shared by every dependent of `parent`.
pub fn labels_for(parent_name: &str, image: &ImageRef) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "minecraft-operator".to_string()),
        ("app.kubernetes.io/version".to_string(), image.tag().to_string()),
        ("app.kubernetes.io/managed-by".to_string(), "MinecraftController".to_string()),
        ("cache.example.com/name".to_string(), parent_name.to_string()),
        ("containertype".to_string(), "minecraft-server".to_string()),
    ])
}

/// Controller owner reference to `parent`. Fails if the parent was never persisted.
pub fn owner_reference(parent: &Minecraft) -> Result<OwnerReference, SynthesisError> {
    let mut oref = parent
        .controller_owner_ref(&())
        .ok_or_else(|| SynthesisError::MissingOwnerIdentity(parent.metadata.name.clone().unwrap_or_default()))?;
    if oref.uid.is_empty() {
        return Err(SynthesisError::MissingOwnerIdentity(oref.name));
    }
    oref.block_owner_deletion = Some(true);
    Ok(oref)
}

/// Metadata skeleton for a dependent: parent name and namespace plus the owner reference.
pub(crate) fn dependent_meta(parent: &Minecraft) -> Result<ObjectMeta, SynthesisError> {
    let name = parent.metadata.name.clone().unwrap_or_default();
    let namespace = parent.metadata.namespace.clone().ok_or_else(|| SynthesisError::MissingNamespace(name.clone()))?;
    Ok(ObjectMeta {
        name: Some(name),
        namespace: Some(namespace),
        owner_references: Some(vec![owner_reference(parent)?]),
        ..Default::default()
    })
}
