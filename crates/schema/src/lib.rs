//! Craftop schema: the `Minecraft` custom resource owned by the controller.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "cache.example.com";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "Minecraft";

/// Desired state of a Minecraft server instance.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "cache.example.com", version = "v1alpha1", kind = "Minecraft", namespaced)]
#[kube(status = "MinecraftStatus", shortname = "mc")]
#[serde(rename_all = "camelCase")]
pub struct MinecraftSpec {
    /// Desired number of server replicas. Stored but not yet reconciled against the workload.
    #[serde(default = "default_size")]
    pub size: i32,
}

impl Default for MinecraftSpec {
    fn default() -> Self { Self { size: default_size() } }
}

fn default_size() -> i32 { 1 }

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MinecraftStatus {
    /// Observability conditions (`Available`, `Degraded`), one entry per type.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Minecraft {
    /// Conditions currently recorded on the object, empty when status was never written.
    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }

    /// Mutable access to the condition list, materialising an empty status if needed.
    pub fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(MinecraftStatus::default).conditions
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
