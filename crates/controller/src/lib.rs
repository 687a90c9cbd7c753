//! Craftop controller: the reconcile loop for `Minecraft` objects.
//!
//! A pass fetches the parent by key, then either runs the finalizer branch
//! (parent marked for deletion) or walks the dependent plan and creates the
//! first missing dependent. A pass issues at most one dependent create and
//! returns a [`Directive`] for the scheduler; failures come back as a
//! [`ReconcileError`], which the scheduler turns into a backoff.

#![forbid(unsafe_code)]

use std::time::Duration;

use craftop_core::{Directive, EventRecorder, StateStore};
use craftop_synth::SynthConfig;

mod backoff;
mod error;
mod plan;
mod reconcile;

pub use backoff::Backoff;
pub use error::{ReconcileError, StoreOp};
pub use plan::{after_create, standard_plan, Step};

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Requeue delay after creating a dependent that takes time to settle.
    pub settle_delay: Duration,
    /// Deadline applied to every individual store call.
    pub call_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self { Self { settle_delay: DEFAULT_SETTLE_DELAY, call_timeout: DEFAULT_CALL_TIMEOUT } }
}

/// Reconciles `Minecraft` objects held in `S`, reporting events through `R`.
pub struct Reconciler<S, R> {
    store: S,
    recorder: R,
    steps: Vec<Step>,
    cfg: ReconcilerConfig,
}

impl<S: StateStore, R: EventRecorder> Reconciler<S, R> {
    pub fn new(store: S, recorder: R, synth: SynthConfig, cfg: ReconcilerConfig) -> Self {
        let steps = standard_plan(synth, cfg.settle_delay);
        Self::with_steps(store, recorder, steps, cfg)
    }

    /// Use a custom plan. Steps are walked in the order given.
    pub fn with_steps(store: S, recorder: R, steps: Vec<Step>, cfg: ReconcilerConfig) -> Self {
        Self { store, recorder, steps, cfg }
    }

    pub fn store(&self) -> &S { &self.store }

    pub fn config(&self) -> &ReconcilerConfig { &self.cfg }
}

/// Convenience for schedulers that only care whether to come back.
pub fn requeue_delay(directive: Directive) -> Option<Duration> {
    match directive {
        Directive::Stop => None,
        Directive::RequeueImmediate => Some(Duration::ZERO),
        Directive::RequeueAfter(d) => Some(d),
    }
}
