use std::collections::BTreeMap;
use std::sync::Arc;

use craftop_core::{Dependent, DependentKind};
use craftop_schema::Minecraft;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};

use crate::{dependent_meta, labels_for, ImageRef, SynthConfig, SynthesisError, Synthesizer};

pub const SERVER_PORT: i32 = 25565;
const ROUTER_ANNOTATION: &str = "mc-router.itzg.me/externalServerName";

/// Cluster service in front of the server pod, optionally routed by mc-router.
pub struct EndpointSynth {
    cfg: Arc<SynthConfig>,
}

impl EndpointSynth {
    pub fn new(cfg: Arc<SynthConfig>) -> Self { Self { cfg } }
}

impl Synthesizer for EndpointSynth {
    fn kind(&self) -> DependentKind { DependentKind::NetworkEndpoint }

    fn synthesize(&self, parent: &Minecraft) -> Result<Dependent, SynthesisError> {
        let image = ImageRef::parse(&self.cfg.image)?;
        let mut metadata = dependent_meta(parent)?;
        let name = metadata.name.clone().unwrap_or_default();
        let labels = labels_for(&name, &image);
        metadata.labels = Some(labels.clone());
        if let Some(domain) = self.cfg.external_domain.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            let host = format!("{}.{}", name, domain.trim_start_matches('.'));
            metadata.annotations = Some(BTreeMap::from([(ROUTER_ANNOTATION.to_string(), host)]));
        }

        Ok(Dependent::NetworkEndpoint(Service {
            metadata,
            spec: Some(ServiceSpec {
                selector: Some(labels),
                ports: Some(vec![ServicePort {
                    name: Some("minecraft".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: SERVER_PORT,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }))
    }
}
