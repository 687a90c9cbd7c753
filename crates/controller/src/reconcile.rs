use std::future::Future;
use std::time::Instant;

use chrono::Utc;
use craftop_core::conditions::{
    condition, set_condition, Condition, ConditionStatus, REASON_FINALIZING, REASON_RECONCILING, TYPE_AVAILABLE,
    TYPE_DEGRADED,
};
use craftop_core::finalizer::{add_obligation, has_obligation, remove_obligation, FINALIZER};
use craftop_core::{Directive, EventRecorder, ObjectKey, Severity, StateStore, StoreError};
use craftop_schema::Minecraft;
use craftop_synth::SynthesisError;
use metrics::{counter, histogram};
use tracing::{debug, error, info, instrument, warn};

use crate::{ReconcileError, Reconciler, Step, StoreOp};

/// Which part of the parent a write targets.
#[derive(Clone, Copy)]
enum Target {
    Parent,
    Status,
}

impl Target {
    fn op(self) -> StoreOp {
        match self {
            Target::Parent => StoreOp::UpdateParent,
            Target::Status => StoreOp::UpdateStatus,
        }
    }
}

/// Per-pass bookkeeping.
struct Pass<'a> {
    key: &'a ObjectKey,
    /// A pass may recover from at most one write conflict.
    conflict_refetched: bool,
}

impl<S: StateStore, R: EventRecorder> Reconciler<S, R> {
    /// Run one reconcile pass for `key`.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Directive, ReconcileError> {
        let t0 = Instant::now();
        counter!("reconcile_passes", 1u64);
        let res = match self.pass(key).await {
            Err(ReconcileError::Gone(_)) => {
                info!("minecraft resource disappeared mid-pass; assuming it was deleted");
                Ok(Directive::Stop)
            }
            other => other,
        };
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(d) => debug!(directive = ?d, "pass complete"),
            Err(e) => {
                counter!("reconcile_errors", 1u64, "kind" => e.kind_label());
                error!(error = %e, "reconcile failed");
            }
        }
        res
    }

    async fn pass(&self, key: &ObjectKey) -> Result<Directive, ReconcileError> {
        let mut pass = Pass { key, conflict_refetched: false };

        let Some(mut parent) = self.fetch(key).await? else {
            info!("minecraft resource not found; ignoring since object must be deleted");
            return Ok(Directive::Stop);
        };

        if parent.conditions().is_empty() {
            let cond = condition(TYPE_AVAILABLE, ConditionStatus::Unknown, REASON_RECONCILING, "Starting reconciliation", Utc::now());
            self.set_status(&mut pass, parent, &cond).await?;
            // Re-read so later writes start from the latest version.
            parent = self.refetch(key).await?;
        }

        if !parent.is_marked_for_deletion() && !has_obligation(&parent.metadata, FINALIZER) {
            info!("adding finalizer");
            // A conflict re-fetch may observe a deletion marker; never add the finalizer then.
            parent = self
                .write(&mut pass, parent, Target::Parent, |p| {
                    !p.is_marked_for_deletion() && add_obligation(&mut p.metadata, FINALIZER)
                })
                .await?;
        }

        if parent.is_marked_for_deletion() {
            if has_obligation(&parent.metadata, FINALIZER) {
                self.finalize(&mut pass, parent).await?;
            } else {
                debug!("marked for deletion without finalizer; nothing to clean up");
            }
            return Ok(Directive::Stop);
        }

        self.converge(&mut pass, &parent).await
    }

    /// Pre-delete sequence: Degraded=Unknown, cleanup, re-fetch, Degraded=True, drop the finalizer.
    async fn finalize(&self, pass: &mut Pass<'_>, parent: Minecraft) -> Result<(), ReconcileError> {
        info!("performing finalizer operations before deletion");
        counter!("finalizations", 1u64);
        let name = pass.key.name.clone();

        let cond = condition(
            TYPE_DEGRADED,
            ConditionStatus::Unknown,
            REASON_FINALIZING,
            format!("Performing finalizer operations for the custom resource: {}", name),
            Utc::now(),
        );
        let parent = self.set_status(pass, parent, &cond).await?;

        self.cleanup(&parent).await;

        let parent = self.refetch(pass.key).await?;
        let cond = condition(
            TYPE_DEGRADED,
            ConditionStatus::True,
            REASON_FINALIZING,
            format!("Finalizer operations for custom resource {} were successfully accomplished", name),
            Utc::now(),
        );
        let parent = self.set_status(pass, parent, &cond).await?;

        info!("removing finalizer after cleanup");
        self.write(pass, parent, Target::Parent, |p| remove_obligation(&mut p.metadata, FINALIZER)).await?;
        Ok(())
    }

    /// Best-effort cleanup. Owned dependents are left to the store's cascade.
    async fn cleanup(&self, parent: &Minecraft) {
        let (name, ns) = (parent.metadata.name.as_deref().unwrap_or_default(), parent.metadata.namespace.as_deref().unwrap_or_default());
        let message = format!("Custom Resource {} is being deleted from the namespace {}", name, ns);
        self.recorder.record(parent, Severity::Warning, "Deleting", &message).await;
    }

    /// Create the first missing dependent in plan order, or stop when all exist.
    async fn converge(&self, pass: &mut Pass<'_>, parent: &Minecraft) -> Result<Directive, ReconcileError> {
        for step in &self.steps {
            let found = self
                .deadline(self.store.get_dependent(step.kind, pass.key))
                .await
                .map_err(|e| ReconcileError::store(StoreOp::GetDependent(step.kind), pass.key, e))?;
            if found.is_none() {
                return self.create(pass, parent, step).await;
            }
        }
        debug!("all dependents present");
        Ok(Directive::Stop)
    }

    async fn create(&self, pass: &mut Pass<'_>, parent: &Minecraft, step: &Step) -> Result<Directive, ReconcileError> {
        let manifest = match step.synth.synthesize(parent) {
            Ok(m) => m,
            Err(source) => return Err(self.report_synthesis_failure(pass, parent, step, source).await),
        };
        info!(kind = %step.kind, "creating {}", step.kind.k8s_kind());
        self.deadline(self.store.create_dependent(&manifest))
            .await
            .map_err(|e| ReconcileError::store(StoreOp::CreateDependent(step.kind), pass.key, e))?;
        counter!("dependents_created", 1u64, "kind" => step.kind.as_str());
        Ok(step.after_create)
    }

    /// Record `Available=False` for a synthesis failure. The synthesis error is always returned.
    async fn report_synthesis_failure(
        &self,
        pass: &mut Pass<'_>,
        parent: &Minecraft,
        step: &Step,
        source: SynthesisError,
    ) -> ReconcileError {
        warn!(kind = %step.kind, error = %source, "failed to define dependent");
        let cond = condition(
            TYPE_AVAILABLE,
            ConditionStatus::False,
            REASON_RECONCILING,
            format!("Failed to create {} for the custom resource ({}): ({})", step.kind.k8s_kind(), pass.key.name, source),
            Utc::now(),
        );
        let key = pass.key.clone();
        match self.set_status(pass, parent.clone(), &cond).await {
            Ok(_) => ReconcileError::Synthesis { kind: step.kind, key, source },
            Err(ReconcileError::Store { source: report, .. }) => {
                ReconcileError::ReportFailed { kind: step.kind, key, source, report }
            }
            Err(ReconcileError::Gone(k)) => ReconcileError::Gone(k),
            Err(other) => ReconcileError::ReportFailed {
                kind: step.kind,
                key,
                source,
                report: StoreError::Unavailable(other.to_string()),
            },
        }
    }

    async fn set_status(&self, pass: &mut Pass<'_>, parent: Minecraft, cond: &Condition) -> Result<Minecraft, ReconcileError> {
        self.write(pass, parent, Target::Status, |p| set_condition(p.conditions_mut(), cond.clone())).await
    }

    /// Apply `mutate` and persist it. On a version conflict the parent is
    /// re-fetched once per pass, `mutate` re-applied and the write retried.
    /// A mutation that changes nothing is not written.
    async fn write<F>(&self, pass: &mut Pass<'_>, mut parent: Minecraft, target: Target, mutate: F) -> Result<Minecraft, ReconcileError>
    where
        F: Fn(&mut Minecraft) -> bool,
    {
        if !mutate(&mut parent) {
            return Ok(parent);
        }
        match self.persist(target, &parent, pass.key).await {
            Err(e) if e.is_conflict() && !pass.conflict_refetched => {
                pass.conflict_refetched = true;
                counter!("conflict_refetches", 1u64);
                warn!(error = %e, "write conflict; re-fetching once and retrying");
                let mut fresh = self.refetch(pass.key).await?;
                if !mutate(&mut fresh) {
                    return Ok(fresh);
                }
                self.persist(target, &fresh, pass.key).await
            }
            other => other,
        }
    }

    /// A parent that vanished under the write surfaces as `Gone`, like an absent re-fetch.
    async fn persist(&self, target: Target, parent: &Minecraft, key: &ObjectKey) -> Result<Minecraft, ReconcileError> {
        let res = match target {
            Target::Parent => self.deadline(self.store.update_parent(parent)).await,
            Target::Status => self.deadline(self.store.update_parent_status(parent)).await,
        };
        match res {
            Ok(written) => {
                if matches!(target, Target::Status) {
                    counter!("status_writes", 1u64);
                }
                Ok(written)
            }
            Err(StoreError::NotFound(_)) => Err(ReconcileError::Gone(key.clone())),
            Err(e) => Err(ReconcileError::store(target.op(), key, e)),
        }
    }

    async fn fetch(&self, key: &ObjectKey) -> Result<Option<Minecraft>, ReconcileError> {
        self.deadline(self.store.get_parent(key))
            .await
            .map_err(|e| ReconcileError::store(StoreOp::GetParent, key, e))
    }

    /// Fetch that must find the parent; absence mid-pass is reported as `Gone`.
    async fn refetch(&self, key: &ObjectKey) -> Result<Minecraft, ReconcileError> {
        self.fetch(key).await?.ok_or_else(|| ReconcileError::Gone(key.clone()))
    }

    /// Bound a store call by the configured deadline.
    async fn deadline<T>(&self, fut: impl Future<Output = Result<T, StoreError>>) -> Result<T, StoreError> {
        match tokio::time::timeout(self.cfg.call_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::Unavailable(format!("deadline of {:?} exceeded", self.cfg.call_timeout))),
        }
    }
}
