#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use craftop_controller::{ReconcileError, Reconciler, ReconcilerConfig, StoreOp};
use craftop_core::conditions::{
    condition, find_condition, is_status, ConditionStatus, REASON_RECONCILING, TYPE_AVAILABLE, TYPE_DEGRADED,
};
use craftop_core::finalizer::{has_obligation, FINALIZER};
use craftop_core::{Dependent, DependentKind, Directive, ObjectKey, Severity, StateStore, StoreError};
use craftop_schema::{Minecraft, MinecraftSpec, MinecraftStatus};
use craftop_store::{MemoryStore, Op};
use craftop_synth::SynthConfig;

const SETTLE: Duration = Duration::from_secs(60);

type Rec = Reconciler<Arc<MemoryStore>, Arc<MemoryStore>>;

fn key() -> ObjectKey { ObjectKey::new("games", "survival") }

fn minecraft() -> Minecraft {
    let mut mc = Minecraft::new("survival", MinecraftSpec::default());
    mc.metadata.namespace = Some("games".into());
    mc
}

fn reconciler_with(store: &Arc<MemoryStore>, synth: SynthConfig) -> Rec {
    Reconciler::new(Arc::clone(store), Arc::clone(store), synth, ReconcilerConfig::default())
}

fn setup() -> (Arc<MemoryStore>, Rec) {
    let store = Arc::new(MemoryStore::new());
    store.insert_parent(minecraft()).unwrap();
    let rec = reconciler_with(&store, SynthConfig::default());
    (store, rec)
}

/// A parent that already went through initialization: condition set, finalizer present.
fn initialized() -> Minecraft {
    let mut mc = minecraft();
    mc.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
    mc.status = Some(MinecraftStatus {
        conditions: vec![condition(
            TYPE_AVAILABLE,
            ConditionStatus::Unknown,
            REASON_RECONCILING,
            "Starting reconciliation",
            chrono::Utc::now(),
        )],
    });
    mc
}

async fn converge(rec: &Rec) -> Vec<Directive> {
    let mut out = Vec::new();
    for _ in 0..8 {
        let d = rec.reconcile(&key()).await.unwrap();
        out.push(d);
        if d == Directive::Stop { break; }
    }
    out
}

fn ops(store: &MemoryStore) -> Vec<Op> {
    store.journal().into_iter().map(|c| c.op).filter(|op| *op != Op::GetDependent).collect()
}

#[tokio::test]
async fn converges_one_dependent_per_pass() {
    let (store, rec) = setup();
    let directives = converge(&rec).await;
    assert_eq!(
        directives,
        [
            Directive::RequeueAfter(SETTLE),
            Directive::RequeueImmediate,
            Directive::RequeueAfter(SETTLE),
            Directive::RequeueImmediate,
            Directive::Stop,
        ]
    );
    assert_eq!(store.dependent_kinds(&key()), DependentKind::ORDER);

    let parent = store.parent(&key()).unwrap();
    assert!(has_obligation(&parent.metadata, FINALIZER));
    assert!(is_status(parent.conditions(), TYPE_AVAILABLE, ConditionStatus::Unknown));
    let uid = parent.metadata.uid.clone().unwrap();
    for kind in DependentKind::ORDER {
        let dep = store.dependent(kind, &key()).unwrap();
        assert_eq!(dep.controller_uid(), Some(uid.as_str()), "{}", kind);
    }
}

#[tokio::test]
async fn first_pass_creates_only_the_volume_claim() {
    let (store, rec) = setup();
    let d = rec.reconcile(&key()).await.unwrap();
    assert_eq!(d, Directive::RequeueAfter(SETTLE));
    assert_eq!(store.dependent_kinds(&key()), [DependentKind::VolumeClaim]);

    // init status, finalizer, one create
    let writes: Vec<_> = store.journal().into_iter().filter(|c| c.op.is_write()).map(|c| c.op).collect();
    assert_eq!(writes, [Op::UpdateStatus, Op::UpdateParent, Op::CreateDependent]);
    let history = store.status_history(&key());
    assert_eq!(history.len(), 1);
    let init = find_condition(&history[0], TYPE_AVAILABLE).unwrap();
    assert_eq!(init.status, "Unknown");
    assert_eq!(init.reason, "Reconciling");
    assert_eq!(init.message, "Starting reconciliation");
}

#[tokio::test]
async fn converged_parent_is_not_written_again() {
    let (store, rec) = setup();
    converge(&rec).await;
    let before = store.parent(&key()).unwrap();
    store.clear_journal();

    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::Stop);
    assert_eq!(store.write_count(), 0);
    let after = store.parent(&key()).unwrap();
    assert_eq!(before.metadata.resource_version, after.metadata.resource_version);
}

#[tokio::test]
async fn absent_parent_is_ignored() {
    let store = Arc::new(MemoryStore::new());
    let rec = reconciler_with(&store, SynthConfig::default());
    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::Stop);
    assert_eq!(store.write_count(), 0);
    assert!(store.journal().iter().all(|c| c.op == Op::GetParent));
}

#[tokio::test]
async fn deletion_before_finalizer_skips_cleanup() {
    let store = Arc::new(MemoryStore::new());
    let mut mc = minecraft();
    // Someone else holds the object so the deletion marker sticks.
    mc.metadata.finalizers = Some(vec!["backup.example.com/hold".to_string()]);
    store.insert_parent(mc).unwrap();
    store.request_delete(&key()).unwrap();
    let rec = reconciler_with(&store, SynthConfig::default());

    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::Stop);
    let parent = store.parent(&key()).unwrap();
    assert!(!has_obligation(&parent.metadata, FINALIZER));
    assert!(find_condition(parent.conditions(), TYPE_DEGRADED).is_none());
    assert!(store.journal().iter().all(|c| c.op != Op::RecordEvent && c.op != Op::UpdateParent));
    assert!(store.dependent_kinds(&key()).is_empty());
}

#[tokio::test]
async fn finalizer_runs_in_order_then_releases() {
    let (store, rec) = setup();
    converge(&rec).await;
    store.request_delete(&key()).unwrap();
    assert!(store.parent(&key()).is_some(), "finalizer must hold the parent");
    store.clear_journal();

    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::Stop);
    assert_eq!(
        ops(&store),
        [Op::GetParent, Op::UpdateStatus, Op::RecordEvent, Op::GetParent, Op::UpdateStatus, Op::UpdateParent]
    );

    let history = store.status_history(&key());
    assert_eq!(history.len(), 2);
    let first = find_condition(&history[0], TYPE_DEGRADED).unwrap();
    assert_eq!((first.status.as_str(), first.reason.as_str()), ("Unknown", "Finalizing"));
    assert_eq!(first.message, "Performing finalizer operations for the custom resource: survival");
    let second = find_condition(&history[1], TYPE_DEGRADED).unwrap();
    assert_eq!((second.status.as_str(), second.reason.as_str()), ("True", "Finalizing"));

    let event = store.journal().into_iter().find_map(|c| c.event).unwrap();
    assert_eq!(event.0, Severity::Warning);
    assert_eq!(event.1, "Deleting");
    assert_eq!(event.2, "Custom Resource survival is being deleted from the namespace games");

    // Releasing the last finalizer removes the parent and cascades to its dependents.
    assert!(store.parent(&key()).is_none());
    assert!(store.dependent_kinds(&key()).is_empty());

    store.clear_journal();
    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::Stop);
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn interrupted_finalization_resumes_next_pass() {
    let (store, rec) = setup();
    converge(&rec).await;
    store.request_delete(&key()).unwrap();
    store.fail_next(Op::UpdateParent, StoreError::Unavailable("apiserver restarting".into()));

    let err = rec.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store { op: StoreOp::UpdateParent, .. }), "{:?}", err);
    let held = store.parent(&key()).unwrap();
    assert!(held.is_marked_for_deletion());
    assert!(has_obligation(&held.metadata, FINALIZER));
    assert!(is_status(held.conditions(), TYPE_DEGRADED, ConditionStatus::True));
    assert_eq!(store.dependent_kinds(&key()), DependentKind::ORDER);

    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::Stop);
    assert!(store.parent(&key()).is_none());
    assert!(store.dependent_kinds(&key()).is_empty());
    let deleting = store.journal().into_iter().filter_map(|c| c.event).filter(|e| e.1 == "Deleting").count();
    assert_eq!(deleting, 2, "cleanup is announced again on the retried pass");
}

#[tokio::test]
async fn parent_vanishing_under_status_write_stops_quietly() {
    let (store, rec) = setup();
    store.fail_next(Op::UpdateStatus, StoreError::NotFound("minecrafts \"survival\" not found".into()));

    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::Stop);
    assert_eq!(store.write_count(), 0);
    assert!(store.dependent_kinds(&key()).is_empty());
}

#[tokio::test]
async fn parent_vanishing_under_finalizer_write_stops_quietly() {
    let store = Arc::new(MemoryStore::new());
    let mut mc = initialized();
    mc.metadata.finalizers = None;
    store.insert_parent(mc).unwrap();
    let rec = reconciler_with(&store, SynthConfig::default());
    store.fail_next(Op::UpdateParent, StoreError::NotFound("minecrafts \"survival\" not found".into()));

    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::Stop);
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn single_conflict_is_recovered_by_refetch() {
    let (store, rec) = setup();
    store.fail_next(Op::UpdateStatus, StoreError::Conflict("stale".into()));

    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::RequeueAfter(SETTLE));
    let journal = store.journal();
    let failed = journal.iter().position(|c| c.op == Op::UpdateStatus && !c.ok()).unwrap();
    let retried = journal.iter().position(|c| c.op == Op::UpdateStatus && c.ok()).unwrap();
    assert!(retried > failed);
    let between: Vec<_> = journal[failed + 1..retried].iter().map(|c| c.op).collect();
    assert_eq!(between, [Op::GetParent]);
    assert_eq!(store.dependent_kinds(&key()), [DependentKind::VolumeClaim]);
}

#[tokio::test]
async fn second_conflict_in_a_pass_propagates() {
    let (store, rec) = setup();
    store.fail_next(Op::UpdateStatus, StoreError::Conflict("stale".into()));
    store.fail_next(Op::UpdateParent, StoreError::Conflict("stale again".into()));

    let err = rec.reconcile(&key()).await.unwrap_err();
    assert!(err.is_conflict(), "{}", err);
    assert!(matches!(err, ReconcileError::Store { op: StoreOp::UpdateParent, .. }), "{:?}", err);
    assert_eq!(err.directive(), Directive::RequeueImmediate);
    assert!(store.dependent_kinds(&key()).is_empty());

    // The next pass starts with a fresh budget.
    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::RequeueAfter(SETTLE));
}

#[tokio::test]
async fn synthesis_failure_marks_parent_unavailable() {
    let store = Arc::new(MemoryStore::new());
    store.insert_parent(minecraft()).unwrap();
    let rec = reconciler_with(&store, SynthConfig { image: "itzg/minecraft-server:".into(), ..SynthConfig::default() });

    let err = rec.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Synthesis { kind: DependentKind::VolumeClaim, .. }), "{:?}", err);
    assert_eq!(err.directive(), Directive::RequeueImmediate);

    let parent = store.parent(&key()).unwrap();
    let available = find_condition(parent.conditions(), TYPE_AVAILABLE).unwrap();
    assert_eq!(available.status, "False");
    assert_eq!(available.reason, "Reconciling");
    assert!(
        available.message.starts_with("Failed to create PersistentVolumeClaim for the custom resource (survival): ("),
        "{}",
        available.message
    );
    assert!(store.dependent_kinds(&key()).is_empty());
}

#[tokio::test]
async fn failed_report_keeps_synthesis_error() {
    let store = Arc::new(MemoryStore::new());
    store.insert_parent(initialized()).unwrap();
    let rec = reconciler_with(&store, SynthConfig { storage_size: " ".into(), ..SynthConfig::default() });
    store.fail_next(Op::UpdateStatus, StoreError::Unavailable("etcd leader lost".into()));

    let err = rec.reconcile(&key()).await.unwrap_err();
    match &err {
        ReconcileError::ReportFailed { kind, report, .. } => {
            assert_eq!(*kind, DependentKind::VolumeClaim);
            assert_eq!(*report, StoreError::Unavailable("etcd leader lost".into()));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    let msg = err.to_string();
    assert!(msg.contains("storage size must not be empty"), "{}", msg);
    assert!(msg.contains("etcd leader lost"), "{}", msg);
}

#[tokio::test]
async fn store_failures_propagate() {
    let (store, rec) = setup();
    store.fail_next(Op::GetParent, StoreError::Unavailable("connection refused".into()));
    let err = rec.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store { op: StoreOp::GetParent, .. }), "{:?}", err);
    assert_eq!(store.write_count(), 0);

    converge(&rec).await;
    store.delete_dependent(DependentKind::Config, &key());
    store.fail_next(Op::CreateDependent, StoreError::Conflict("configmaps \"survival\" already exists".into()));
    let err = rec.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store { op: StoreOp::CreateDependent(DependentKind::Config), .. }));
    assert!(err.is_conflict());
}

#[tokio::test]
async fn externally_deleted_dependent_is_recreated() {
    let (store, rec) = setup();
    converge(&rec).await;
    store.delete_dependent(DependentKind::Workload, &key()).unwrap();

    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::RequeueAfter(SETTLE));
    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::Stop);
    assert_eq!(store.dependent_kinds(&key()), DependentKind::ORDER);
    match store.dependent(DependentKind::Workload, &key()).unwrap() {
        Dependent::Workload(sts) => assert_eq!(sts.spec.unwrap().replicas, Some(1)),
        other => panic!("unexpected dependent: {:?}", other.kind()),
    }
}

#[tokio::test]
async fn writes_notify_subscribers() {
    let (store, rec) = setup();
    let mut rx = store.subscribe();
    rec.reconcile(&key()).await.unwrap();
    assert_eq!(rx.try_recv().unwrap(), key());
}

/// Store whose parent reads never complete.
struct Stalled(Arc<MemoryStore>);

#[async_trait]
impl StateStore for Stalled {
    async fn get_parent(&self, _key: &ObjectKey) -> Result<Option<Minecraft>, StoreError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(None)
    }
    async fn update_parent(&self, parent: &Minecraft) -> Result<Minecraft, StoreError> {
        self.0.update_parent(parent).await
    }
    async fn update_parent_status(&self, parent: &Minecraft) -> Result<Minecraft, StoreError> {
        self.0.update_parent_status(parent).await
    }
    async fn get_dependent(&self, kind: DependentKind, key: &ObjectKey) -> Result<Option<Dependent>, StoreError> {
        self.0.get_dependent(kind, key).await
    }
    async fn create_dependent(&self, dependent: &Dependent) -> Result<(), StoreError> {
        self.0.create_dependent(dependent).await
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_call_hits_deadline() {
    let store = Arc::new(MemoryStore::new());
    let cfg = ReconcilerConfig { call_timeout: Duration::from_secs(5), ..ReconcilerConfig::default() };
    let rec = Reconciler::new(Stalled(Arc::clone(&store)), Arc::clone(&store), SynthConfig::default(), cfg);

    let err = rec.reconcile(&key()).await.unwrap_err();
    match err {
        ReconcileError::Store { op: StoreOp::GetParent, source: StoreError::Unavailable(msg), .. } => {
            assert!(msg.contains("deadline"), "{}", msg)
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

/// Store that marks the parent for deletion during its first parent write and reports a conflict.
struct DeletedMidWrite {
    inner: Arc<MemoryStore>,
    fired: AtomicBool,
}

#[async_trait]
impl StateStore for DeletedMidWrite {
    async fn get_parent(&self, key: &ObjectKey) -> Result<Option<Minecraft>, StoreError> {
        self.inner.get_parent(key).await
    }
    async fn update_parent(&self, parent: &Minecraft) -> Result<Minecraft, StoreError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let key = ObjectKey::of(&parent.metadata).unwrap();
            self.inner.request_delete(&key)?;
            return Err(StoreError::Conflict("object was modified".into()));
        }
        self.inner.update_parent(parent).await
    }
    async fn update_parent_status(&self, parent: &Minecraft) -> Result<Minecraft, StoreError> {
        self.inner.update_parent_status(parent).await
    }
    async fn get_dependent(&self, kind: DependentKind, key: &ObjectKey) -> Result<Option<Dependent>, StoreError> {
        self.inner.get_dependent(kind, key).await
    }
    async fn create_dependent(&self, dependent: &Dependent) -> Result<(), StoreError> {
        self.inner.create_dependent(dependent).await
    }
}

#[tokio::test]
async fn deletion_seen_on_conflict_refetch_is_not_finalized() {
    let store = Arc::new(MemoryStore::new());
    let mut mc = minecraft();
    mc.metadata.finalizers = Some(vec!["backup.example.com/hold".to_string()]);
    store.insert_parent(mc).unwrap();
    let wrapped = DeletedMidWrite { inner: Arc::clone(&store), fired: AtomicBool::new(false) };
    let rec = Reconciler::new(wrapped, Arc::clone(&store), SynthConfig::default(), ReconcilerConfig::default());

    assert_eq!(rec.reconcile(&key()).await.unwrap(), Directive::Stop);
    let parent = store.parent(&key()).unwrap();
    assert!(parent.is_marked_for_deletion());
    assert!(!has_obligation(&parent.metadata, FINALIZER));
    assert!(has_obligation(&parent.metadata, "backup.example.com/hold"));
    assert!(store.dependent_kinds(&key()).is_empty());
    assert!(store.journal().iter().all(|c| c.op != Op::UpdateParent && c.op != Op::CreateDependent));
}

#[tokio::test]
async fn concurrent_passes_keep_keys_apart() {
    let store = Arc::new(MemoryStore::new());
    let survival = store.insert_parent(minecraft()).unwrap();
    let mut mc = Minecraft::new("creative", MinecraftSpec::default());
    mc.metadata.namespace = Some("games".into());
    let creative = store.insert_parent(mc).unwrap();
    let rec = reconciler_with(&store, SynthConfig::default());
    let (a, b) = (key(), ObjectKey::new("games", "creative"));

    let (mut a_done, mut b_done) = (false, false);
    for _ in 0..8 {
        let (da, db) = tokio::join!(
            async { if a_done { Ok(Directive::Stop) } else { rec.reconcile(&a).await } },
            async { if b_done { Ok(Directive::Stop) } else { rec.reconcile(&b).await } },
        );
        a_done = da.unwrap() == Directive::Stop;
        b_done = db.unwrap() == Directive::Stop;
        if a_done && b_done { break; }
    }
    assert!(a_done && b_done);

    for (k, parent) in [(&a, &survival), (&b, &creative)] {
        assert_eq!(store.dependent_kinds(k), DependentKind::ORDER, "{}", k);
        let uid = parent.metadata.uid.as_deref();
        for kind in DependentKind::ORDER {
            assert_eq!(store.dependent(kind, k).unwrap().controller_uid(), uid, "{} {}", k, kind);
        }
        assert_eq!(store.status_history(k).len(), 1, "{}", k);
        let writes: Vec<_> = store.journal().into_iter().filter(|c| &c.key == k && c.op.is_write()).map(|c| c.op).collect();
        assert_eq!(writes.len(), 6, "{}: {:?}", k, writes);
    }
    let survival_uid = survival.metadata.uid.as_deref();
    for kind in DependentKind::ORDER {
        let dep = store.dependent(kind, &b).unwrap();
        assert_eq!(dep.key().as_ref(), Some(&b));
        assert_ne!(dep.controller_uid(), survival_uid, "{}", kind);
    }
}

#[tokio::test]
async fn invalid_version_tag_marks_parent_unavailable() {
    let store = Arc::new(MemoryStore::new());
    store.insert_parent(minecraft()).unwrap();
    let rec = reconciler_with(&store, SynthConfig { image: "itzg/minecraft-server:1.20-".into(), ..SynthConfig::default() });

    let err = rec.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Synthesis { kind: DependentKind::VolumeClaim, .. }), "{:?}", err);
    let parent = store.parent(&key()).unwrap();
    let available = find_condition(parent.conditions(), TYPE_AVAILABLE).unwrap();
    assert_eq!(available.status, "False");
    assert!(available.message.contains("not a valid label value"), "{}", available.message);
    assert!(store.dependent_kinds(&key()).is_empty());
}
