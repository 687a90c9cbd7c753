//! Craftop kubehub: kube-rs backed store and event recorder, plus the
//! `kube::runtime::Controller` wiring that schedules reconcile passes.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use kube::{
    api::{Api, PostParams},
    runtime::{
        controller::{self, Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        watcher,
    },
    Client, Resource,
};
use metrics::counter;
use tracing::{debug, info, warn};

use craftop_controller::{Backoff, ReconcileError, Reconciler};
use craftop_core::{Dependent, DependentKind, Directive, EventRecorder, ObjectKey, Severity, StateStore, StoreError};
use craftop_schema::Minecraft;

/// Field manager recorded on every write.
pub const FIELD_MANAGER: &str = "craftop";
/// Controller name reported on events.
pub const REPORTER: &str = "craftop";

fn post_params() -> PostParams { PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() } }

/// Map a kube client error onto the store taxonomy.
pub fn store_error(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            409 => StoreError::Conflict(resp.message),
            404 => StoreError::NotFound(resp.message),
            400 | 422 => StoreError::Invalid(resp.message),
            _ => StoreError::Unavailable(format!("{} ({})", resp.message, resp.code)),
        },
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn name_of(parent: &Minecraft) -> Result<(&str, &str), StoreError> {
    match (parent.metadata.namespace.as_deref(), parent.metadata.name.as_deref()) {
        (Some(ns), Some(name)) => Ok((ns, name)),
        _ => Err(StoreError::Invalid("Minecraft object needs name and namespace".into())),
    }
}

/// [`StateStore`] over the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api<K>(&self, ns: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), ns)
    }
}

#[async_trait]
impl StateStore for KubeStore {
    async fn get_parent(&self, key: &ObjectKey) -> Result<Option<Minecraft>, StoreError> {
        self.api::<Minecraft>(&key.namespace).get_opt(&key.name).await.map_err(store_error)
    }

    async fn update_parent(&self, parent: &Minecraft) -> Result<Minecraft, StoreError> {
        let (ns, name) = name_of(parent)?;
        self.api::<Minecraft>(ns).replace(name, &post_params(), parent).await.map_err(store_error)
    }

    async fn update_parent_status(&self, parent: &Minecraft) -> Result<Minecraft, StoreError> {
        let (ns, name) = name_of(parent)?;
        let body = serde_json::to_vec(parent).map_err(|e| StoreError::Invalid(e.to_string()))?;
        self.api::<Minecraft>(ns).replace_status(name, &post_params(), body).await.map_err(store_error)
    }

    async fn get_dependent(&self, kind: DependentKind, key: &ObjectKey) -> Result<Option<Dependent>, StoreError> {
        let (ns, name) = (key.namespace.as_str(), key.name.as_str());
        let found = match kind {
            DependentKind::VolumeClaim => self.api::<PersistentVolumeClaim>(ns).get_opt(name).await.map(|o| o.map(Dependent::VolumeClaim)),
            DependentKind::Config => self.api::<ConfigMap>(ns).get_opt(name).await.map(|o| o.map(Dependent::Config)),
            DependentKind::Workload => self.api::<StatefulSet>(ns).get_opt(name).await.map(|o| o.map(Dependent::Workload)),
            DependentKind::NetworkEndpoint => self.api::<Service>(ns).get_opt(name).await.map(|o| o.map(Dependent::NetworkEndpoint)),
        };
        found.map_err(store_error)
    }

    async fn create_dependent(&self, dependent: &Dependent) -> Result<(), StoreError> {
        let key = dependent
            .key()
            .ok_or_else(|| StoreError::Invalid(format!("{} needs name and namespace", dependent.kind().k8s_kind())))?;
        let pp = post_params();
        let ns = key.namespace.as_str();
        let res = match dependent {
            Dependent::VolumeClaim(o) => self.api::<PersistentVolumeClaim>(ns).create(&pp, o).await.map(drop),
            Dependent::Config(o) => self.api::<ConfigMap>(ns).create(&pp, o).await.map(drop),
            Dependent::Workload(o) => self.api::<StatefulSet>(ns).create(&pp, o).await.map(drop),
            Dependent::NetworkEndpoint(o) => self.api::<Service>(ns).create(&pp, o).await.map(drop),
        };
        res.map_err(store_error)
    }
}

/// [`EventRecorder`] publishing Kubernetes events against the parent.
#[derive(Clone)]
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(client: Client) -> Self {
        let instance = std::env::var("POD_NAME").ok();
        Self { client, reporter: Reporter { controller: REPORTER.to_string(), instance } }
    }
}

fn event_type(severity: Severity) -> EventType {
    match severity {
        Severity::Normal => EventType::Normal,
        Severity::Warning => EventType::Warning,
    }
}

#[async_trait]
impl EventRecorder for KubeRecorder {
    async fn record(&self, parent: &Minecraft, severity: Severity, reason: &str, message: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), parent.object_ref(&()));
        let event = Event {
            type_: event_type(severity),
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(error = %e, reason, "failed to publish event");
        }
    }
}

/// Scheduler-side translation of a pass outcome.
pub fn action_for(directive: Directive) -> Action {
    match directive {
        Directive::Stop => Action::await_change(),
        Directive::RequeueImmediate => Action::requeue(Duration::ZERO),
        Directive::RequeueAfter(d) => Action::requeue(d),
    }
}

/// Shared state handed to every reconcile invocation.
pub struct Context<S, R> {
    pub reconciler: Reconciler<S, R>,
    pub backoff: Backoff,
}

async fn reconcile<S: StateStore, R: EventRecorder>(obj: Arc<Minecraft>, ctx: Arc<Context<S, R>>) -> Result<Action, ReconcileError> {
    let Some(key) = ObjectKey::of(&obj.metadata) else {
        debug!("skipping object without name or namespace");
        return Ok(Action::await_change());
    };
    let directive = ctx.reconciler.reconcile(&key).await?;
    ctx.backoff.reset(&key);
    Ok(action_for(directive))
}

fn error_policy<S: StateStore, R: EventRecorder>(obj: Arc<Minecraft>, err: &ReconcileError, ctx: Arc<Context<S, R>>) -> Action {
    let Some(key) = ObjectKey::of(&obj.metadata) else { return Action::await_change() };
    let delay = ctx.backoff.next_delay(&key);
    counter!("reconcile_backoffs", 1u64, "kind" => err.kind_label());
    warn!(key = %key, error = %err, retry_in_ms = delay.as_millis() as u64, "scheduling retry");
    Action::requeue(delay)
}

/// Watch `Minecraft` objects (and the four dependent kinds they own) and
/// drive reconcile passes until SIGINT/SIGTERM.
pub async fn run<S, R>(client: Client, namespace: Option<&str>, reconciler: Reconciler<S, R>, backoff: Backoff) -> Result<()>
where
    S: StateStore + 'static,
    R: EventRecorder + 'static,
{
    let parents: Api<Minecraft> = scoped(&client, namespace);
    let cfg = watcher::Config::default();
    let ctx = Arc::new(Context { reconciler, backoff });
    let sweeper = Arc::clone(&ctx);

    info!(ns = ?namespace, "controller started");
    Controller::new(parents, cfg.clone())
        .owns(scoped::<PersistentVolumeClaim>(&client, namespace), cfg.clone())
        .owns(scoped::<ConfigMap>(&client, namespace), cfg.clone())
        .owns(scoped::<StatefulSet>(&client, namespace), cfg.clone())
        .owns(scoped::<Service>(&client, namespace), cfg)
        .shutdown_on_signal()
        .run(reconcile::<S, R>, error_policy::<S, R>, ctx)
        .for_each(|res| {
            let ctx = Arc::clone(&sweeper);
            async move {
                match res {
                    Ok((obj, action)) => debug!(name = %obj.name, ns = ?obj.namespace, ?action, "reconciled"),
                    // A requeue fired for an object that is no longer cached.
                    Err(controller::Error::ObjectNotFound(obj)) => {
                        if let Some(ns) = obj.namespace.clone() {
                            ctx.backoff.reset(&ObjectKey::new(ns, obj.name.clone()));
                        }
                        debug!(name = %obj.name, ns = ?obj.namespace, "object gone; dropped its backoff");
                    }
                    Err(e) => debug!(error = %e, "reconcile round failed"),
                }
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}
