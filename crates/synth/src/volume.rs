use std::collections::BTreeMap;
use std::sync::Arc;

use craftop_core::{Dependent, DependentKind};
use craftop_schema::Minecraft;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::{dependent_meta, labels_for, ImageRef, SynthConfig, SynthesisError, Synthesizer};

/// World data claim, mounted at `/data` by the workload.
pub struct VolumeClaimSynth {
    cfg: Arc<SynthConfig>,
}

impl VolumeClaimSynth {
    pub fn new(cfg: Arc<SynthConfig>) -> Self { Self { cfg } }
}

impl Synthesizer for VolumeClaimSynth {
    fn kind(&self) -> DependentKind { DependentKind::VolumeClaim }

    fn synthesize(&self, parent: &Minecraft) -> Result<Dependent, SynthesisError> {
        let size = self.cfg.storage_size.trim();
        if size.is_empty() {
            return Err(SynthesisError::EmptyStorageSize);
        }
        let image = ImageRef::parse(&self.cfg.image)?;
        let mut metadata = dependent_meta(parent)?;
        metadata.labels = Some(labels_for(metadata.name.as_deref().unwrap_or_default(), &image));

        Ok(Dependent::VolumeClaim(PersistentVolumeClaim {
            metadata,
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size.to_string()))])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::parent;

    #[test]
    fn requests_configured_storage() {
        let cfg = SynthConfig { storage_size: "10Gi".into(), ..Default::default() };
        let Dependent::VolumeClaim(pvc) = VolumeClaimSynth::new(Arc::new(cfg)).synthesize(&parent()).unwrap() else {
            panic!("expected a volume claim");
        };
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"], Quantity("10Gi".into()));
        assert_eq!(pvc.metadata.labels.unwrap()["containertype"], "minecraft-server");
    }

    #[test]
    fn empty_storage_is_rejected() {
        let cfg = SynthConfig { storage_size: " ".into(), ..Default::default() };
        let err = VolumeClaimSynth::new(Arc::new(cfg)).synthesize(&parent()).unwrap_err();
        assert_eq!(err, SynthesisError::EmptyStorageSize);
    }
}
