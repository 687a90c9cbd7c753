//! The ordered dependent plan walked by every convergence pass.

use std::time::Duration;

use craftop_core::{DependentKind, Directive};
use craftop_synth::{SynthConfig, Synthesizer};

/// One entry of the plan: which kind to check, how to build it, and what to return after creating it.
pub struct Step {
    pub kind: DependentKind,
    pub synth: Box<dyn Synthesizer>,
    pub after_create: Directive,
}

/// Claims and workloads take wall-clock time to settle; configs and services are usable at once.
pub fn after_create(kind: DependentKind, settle_delay: Duration) -> Directive {
    match kind {
        DependentKind::VolumeClaim | DependentKind::Workload => Directive::RequeueAfter(settle_delay),
        DependentKind::Config | DependentKind::NetworkEndpoint => Directive::RequeueImmediate,
    }
}

/// Build the plan in dependency order from the standard synthesizers.
pub fn standard_plan(cfg: SynthConfig, settle_delay: Duration) -> Vec<Step> {
    let mut steps: Vec<Step> = craftop_synth::standard(cfg)
        .into_iter()
        .map(|synth| {
            let kind = synth.kind();
            Step { kind, synth, after_create: after_create(kind, settle_delay) }
        })
        .collect();
    steps.sort_by_key(|s| s.kind);
    steps
}
