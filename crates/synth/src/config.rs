use std::collections::BTreeMap;
use std::sync::Arc;

use craftop_core::{Dependent, DependentKind};
use craftop_schema::Minecraft;
use k8s_openapi::api::core::v1::ConfigMap;

use crate::{dependent_meta, labels_for, ImageRef, SynthConfig, SynthesisError, Synthesizer};

/// Server environment, injected into the container via `envFrom`.
pub struct ConfigSynth {
    cfg: Arc<SynthConfig>,
}

impl ConfigSynth {
    pub fn new(cfg: Arc<SynthConfig>) -> Self { Self { cfg } }
}

impl Synthesizer for ConfigSynth {
    fn kind(&self) -> DependentKind { DependentKind::Config }

    fn synthesize(&self, parent: &Minecraft) -> Result<Dependent, SynthesisError> {
        let image = ImageRef::parse(&self.cfg.image)?;
        let mut metadata = dependent_meta(parent)?;
        metadata.labels = Some(labels_for(metadata.name.as_deref().unwrap_or_default(), &image));
        Ok(Dependent::Config(ConfigMap {
            metadata,
            data: Some(BTreeMap::from([("EULA".to_string(), "TRUE".to_string())])),
            ..Default::default()
        }))
    }
}
