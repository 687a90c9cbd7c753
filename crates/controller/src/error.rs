use std::fmt;

use craftop_core::{DependentKind, Directive, ObjectKey, StoreError};
use craftop_synth::SynthesisError;

/// Store operation that failed, for error messages and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    GetParent,
    UpdateParent,
    UpdateStatus,
    GetDependent(DependentKind),
    CreateDependent(DependentKind),
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreOp::GetParent => f.write_str("get parent"),
            StoreOp::UpdateParent => f.write_str("update parent"),
            StoreOp::UpdateStatus => f.write_str("update parent status"),
            StoreOp::GetDependent(k) => write!(f, "get {}", k.k8s_kind()),
            StoreOp::CreateDependent(k) => write!(f, "create {}", k.k8s_kind()),
        }
    }
}

/// Failure of a reconcile pass. Every variant is retryable.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{op} failed for {key}: {source}")]
    Store { op: StoreOp, key: ObjectKey, source: StoreError },

    /// Synthesis failed and `Available=False` was recorded on the parent.
    #[error("cannot build {} for {key}: {source}", kind.k8s_kind())]
    Synthesis { kind: DependentKind, key: ObjectKey, source: SynthesisError },

    /// Synthesis failed and recording it on the parent failed too. Both are kept.
    #[error("cannot build {} for {key}: {source} (recording the failure also failed: {report})", kind.k8s_kind())]
    ReportFailed { kind: DependentKind, key: ObjectKey, source: SynthesisError, report: StoreError },

    /// The parent vanished between two calls of the same pass.
    #[error("{0} disappeared during reconciliation")]
    Gone(ObjectKey),
}

impl ReconcileError {
    pub(crate) fn store(op: StoreOp, key: &ObjectKey, source: StoreError) -> Self {
        ReconcileError::Store { op, key: key.clone(), source }
    }

    /// Directive the scheduler should apply alongside its error backoff.
    pub fn directive(&self) -> Directive { Directive::RequeueImmediate }

    pub fn is_conflict(&self) -> bool {
        match self {
            ReconcileError::Store { source, .. } => source.is_conflict(),
            ReconcileError::ReportFailed { report, .. } => report.is_conflict(),
            _ => false,
        }
    }

    /// Short label for metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ReconcileError::Store { source: StoreError::Conflict(_), .. } => "conflict",
            ReconcileError::Store { .. } => "store",
            ReconcileError::Synthesis { .. } | ReconcileError::ReportFailed { .. } => "synthesis",
            ReconcileError::Gone(_) => "gone",
        }
    }
}
