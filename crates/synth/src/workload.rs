use std::collections::BTreeMap;
use std::sync::Arc;

use craftop_core::{Dependent, DependentKind};
use craftop_schema::Minecraft;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapEnvSource, Container, EnvFromSource, ExecAction, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, Probe, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::{dependent_meta, labels_for, ImageRef, SynthConfig, SynthesisError, Synthesizer};

const CONTAINER_NAME: &str = "minecraft";
const DATA_PATH: &str = "/data";

/// Single-replica server StatefulSet. Replica count is fixed at creation; `spec.size` is not applied.
pub struct WorkloadSynth {
    cfg: Arc<SynthConfig>,
}

impl WorkloadSynth {
    pub fn new(cfg: Arc<SynthConfig>) -> Self { Self { cfg } }
}

fn status_probe(initial_delay_seconds: i32, period_seconds: i32) -> Probe {
    Probe {
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(period_seconds),
        exec: Some(ExecAction { command: Some(vec!["mc-monitor".to_string(), "status".to_string()]) }),
        ..Default::default()
    }
}

impl Synthesizer for WorkloadSynth {
    fn kind(&self) -> DependentKind { DependentKind::Workload }

    fn synthesize(&self, parent: &Minecraft) -> Result<Dependent, SynthesisError> {
        let image = ImageRef::parse(&self.cfg.image)?;
        let mut metadata = dependent_meta(parent)?;
        let name = metadata.name.clone().unwrap_or_default();
        let labels = labels_for(&name, &image);
        metadata.labels = Some(labels.clone());
        metadata.annotations = Some(BTreeMap::from([("reloader.stakater.com/auto".to_string(), "true".to_string())]));

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(image.as_str().to_string()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            env_from: Some(vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource { name: Some(name.clone()), optional: None }),
                ..Default::default()
            }]),
            liveness_probe: Some(status_probe(90, 15)),
            readiness_probe: Some(status_probe(30, 5)),
            volume_mounts: Some(vec![VolumeMount {
                name: name.clone(),
                mount_path: DATA_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let pod = PodSpec {
            containers: vec![container],
            volumes: Some(vec![Volume {
                name: name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource { claim_name: name.clone(), read_only: Some(false) }),
                ..Default::default()
            }]),
            ..Default::default()
        };

        Ok(Dependent::Workload(StatefulSet {
            metadata,
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
                service_name: name,
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                    spec: Some(pod),
                },
                ..Default::default()
            }),
            ..Default::default()
        }))
    }
}
