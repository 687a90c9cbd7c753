use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing::info;

use craftop_controller::{Backoff, Reconciler, ReconcilerConfig};
use craftop_core::{Dependent, Directive, ObjectKey};
use craftop_kubehub::{KubeRecorder, KubeStore};
use craftop_schema::{Minecraft, MinecraftSpec};
use craftop_store::MemoryStore;
use craftop_synth::{SynthConfig, DEFAULT_IMAGE, DEFAULT_STORAGE_SIZE};

#[derive(Parser, Debug)]
#[command(name = "craftop", version, about = "Keeps Minecraft servers converged on Kubernetes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until SIGINT/SIGTERM
    Run(RunArgs),
    /// Print the Minecraft CustomResourceDefinition as YAML
    Crd,
    /// Converge one Minecraft object against an in-memory store and print the dependents
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct SimulateArgs {
    #[arg(long, default_value = "survival")]
    name: String,

    #[arg(long = "ns", default_value = "default")]
    namespace: String,

    #[arg(long, env = "MINECRAFT_IMAGE", default_value = DEFAULT_IMAGE)]
    image: String,

    #[arg(long, env = "MINECRAFT_EXTERNAL_DOMAIN")]
    external_domain: Option<String>,

    /// Upper bound on passes before giving up
    #[arg(long, default_value_t = 16)]
    max_passes: usize,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Server image for every Minecraft workload
    #[arg(long, env = "MINECRAFT_IMAGE")]
    image: Option<String>,

    /// Domain for the mc-router service annotation (`<name>.<domain>`)
    #[arg(long, env = "MINECRAFT_EXTERNAL_DOMAIN")]
    external_domain: Option<String>,

    /// Storage request for each world volume claim
    #[arg(long, env = "MINECRAFT_STORAGE_SIZE", default_value = DEFAULT_STORAGE_SIZE)]
    storage_size: String,

    /// Only watch this namespace (default: all namespaces)
    #[arg(long, env = "CRAFTOP_NAMESPACE")]
    namespace: Option<String>,

    /// Requeue delay after creating a claim or workload
    #[arg(long, env = "CRAFTOP_SETTLE_DELAY_SECS", default_value_t = 60)]
    settle_delay_secs: u64,

    /// Deadline for each individual API call
    #[arg(long, env = "CRAFTOP_STORE_TIMEOUT_SECS", default_value_t = 30)]
    store_timeout_secs: u64,

    /// First retry delay after a failed pass
    #[arg(long, env = "CRAFTOP_BACKOFF_BASE_MS", default_value_t = 500)]
    backoff_base_ms: u64,

    /// Upper bound for retry delays
    #[arg(long, env = "CRAFTOP_BACKOFF_MAX_SECS", default_value_t = 300)]
    backoff_max_secs: u64,
}

impl RunArgs {
    fn synth_config(&self) -> SynthConfig {
        let image = self.image.clone().unwrap_or_else(|| {
            info!(image = DEFAULT_IMAGE, "MINECRAFT_IMAGE not set; using default image");
            DEFAULT_IMAGE.to_string()
        });
        SynthConfig {
            image,
            storage_size: self.storage_size.clone(),
            external_domain: self.external_domain.clone().filter(|d| !d.trim().is_empty()),
        }
    }

    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            settle_delay: Duration::from_secs(self.settle_delay_secs),
            call_timeout: Duration::from_secs(self.store_timeout_secs),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(Duration::from_millis(self.backoff_base_ms), Duration::from_secs(self.backoff_max_secs))
    }
}

fn init_tracing() {
    let env = std::env::var("CRAFTOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CRAFTOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CRAFTOP_METRICS_ADDR; expected host:port");
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let synth = args.synth_config();
    let cfg = args.reconciler_config();
    info!(
        image = %synth.image,
        storage = %synth.storage_size,
        domain = ?synth.external_domain,
        ns = ?args.namespace,
        "starting craftop"
    );

    let client = Client::try_default().await.context("connecting to the Kubernetes API")?;
    let reconciler = Reconciler::new(KubeStore::new(client.clone()), KubeRecorder::new(client.clone()), synth, cfg);
    craftop_kubehub::run(client, args.namespace.as_deref(), reconciler, args.backoff()).await
}

/// Drive passes back to back, ignoring requeue delays, until the object settles.
async fn simulate(args: SimulateArgs) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut mc = Minecraft::new(&args.name, MinecraftSpec::default());
    mc.metadata.namespace = Some(args.namespace.clone());
    store.insert_parent(mc)?;

    let synth = SynthConfig { image: args.image, external_domain: args.external_domain, ..SynthConfig::default() };
    let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&store), synth, ReconcilerConfig::default());
    let key = ObjectKey::new(args.namespace, args.name);

    let mut settled = false;
    for pass in 1..=args.max_passes {
        let directive = reconciler.reconcile(&key).await?;
        info!(pass, ?directive, "pass finished");
        if directive == Directive::Stop {
            settled = true;
            break;
        }
    }
    if !settled {
        anyhow::bail!("{} did not settle within {} passes", key, args.max_passes);
    }

    for kind in store.dependent_kinds(&key) {
        let Some(dep) = store.dependent(kind, &key) else { continue };
        println!("---\n{}", manifest_yaml(&dep)?);
    }
    Ok(())
}

fn manifest_yaml(dep: &Dependent) -> Result<String> {
    let yaml = match dep {
        Dependent::VolumeClaim(o) => serde_yaml::to_string(o)?,
        Dependent::Config(o) => serde_yaml::to_string(o)?,
        Dependent::Workload(o) => serde_yaml::to_string(o)?,
        Dependent::NetworkEndpoint(o) => serde_yaml::to_string(o)?,
    };
    Ok(yaml)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_metrics();
            run(args).await?;
        }
        Commands::Crd => print!("{}", serde_yaml::to_string(&Minecraft::crd())?),
        Commands::Simulate(args) => simulate(args).await?,
    }
    Ok(())
}
