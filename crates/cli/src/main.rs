use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::{Pod, Service};
use serde::Serialize;
use serde_json::Value;
use tokio::signal;
use tracing::{info, warn};
use trellis_controller::{BackoffPolicy, ControlLoop, ControllerConfig, Job, JobRegistry, KindRegistry};
use trellis_core::{EnvVar, JobKind, MemoryCluster};
use trellis_kubehub::{JobResource, KubeCluster, KubeJobSource};

#[derive(Parser, Debug)]
#[command(name = "trellisctl", version, about = "Trellis distributed training-job controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch job custom resources and reconcile their replicas until interrupted
    Run(RunArgs),
    /// Expand a job manifest offline and print the replicas it would create
    Render {
        /// Path to a YAML or JSON custom resource
        file: String,
        /// Namespace for manifests that carry none
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
    },
    /// List supported job kinds with their replica types and ports
    Kinds,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Namespace for replicas of jobs that carry none
    #[arg(long = "ns", env = "TRELLIS_NAMESPACE", default_value = "default")]
    namespace: String,
    /// Only watch custom resources in this namespace (default: all namespaces)
    #[arg(long = "watch-ns", env = "TRELLIS_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,
    /// API group of the job custom resource
    #[arg(long, env = "TRELLIS_GROUP", default_value = "trellis.io")]
    group: String,
    /// API version of the job custom resource
    #[arg(long = "api-version", env = "TRELLIS_API_VERSION", default_value = "v1")]
    api_version: String,
    /// Kind of the watched custom resource, e.g. MXJob or TFJob
    #[arg(long, env = "TRELLIS_KIND", default_value = "MXJob")]
    kind: String,
    /// Plural resource name (default: lower-cased kind plus "s")
    #[arg(long, env = "TRELLIS_PLURAL")]
    plural: Option<String>,
    /// Kinds this deployment builds, comma separated
    #[arg(long, env = "TRELLIS_KINDS", value_delimiter = ',', default_value = "MXJob,TFJob")]
    kinds: Vec<String>,
    /// Re-reconcile every tracked job at this interval; 0 disables
    #[arg(long = "resync-secs", env = "TRELLIS_RESYNC_SECS", default_value_t = 60)]
    resync_secs: u64,
    /// How long purge and cleanup wait for deletions to converge
    #[arg(long = "purge-deadline-secs", env = "TRELLIS_PURGE_DEADLINE_SECS", default_value_t = 60)]
    purge_deadline_secs: u64,
    /// Server-side timeout of one watch session
    #[arg(long = "watch-timeout-secs", env = "TRELLIS_WATCH_TIMEOUT_SECS", default_value_t = 290)]
    watch_timeout_secs: u32,
}

impl RunArgs {
    fn config(&self) -> Result<ControllerConfig> {
        let kinds = KindRegistry::from_names(&self.kinds)?;
        Ok(ControllerConfig {
            namespace: self.namespace.clone(),
            kinds: kinds.enabled().to_vec(),
            purge: BackoffPolicy::default().with_deadline(Duration::from_secs(self.purge_deadline_secs)),
            resync_interval: Some(Duration::from_secs(self.resync_secs)).filter(|d| !d.is_zero()),
            ..ControllerConfig::default()
        })
    }
}

fn init_tracing() {
    let env = std::env::var("TRELLIS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TRELLIS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TRELLIS_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_metrics();
            run(args).await?
        }
        Commands::Render { file, namespace } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {file}"))?;
            let rendered = render(&text, &namespace).await?;
            match cli.output {
                Output::Human => print_rendered(&rendered),
                Output::Json => println!("{}", serde_json::to_string_pretty(&rendered)?),
            }
        }
        Commands::Kinds => {
            let rows = kind_rows();
            match cli.output {
                Output::Human => {
                    println!("{:<8} {:<26} PORTS", "KIND", "REPLICA TYPES");
                    for r in &rows {
                        let ports: Vec<String> = r.ports.iter().map(|p| p.to_string()).collect();
                        println!("{:<8} {:<26} {}", r.kind, r.replica_types.join(", "), ports.join(","));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.config()?;
    let kinds = KindRegistry::new(&config.kinds)?;
    let watched = kinds.resolve(&args.kind).map_err(|e| anyhow!("watched kind {}: {e}", args.kind))?;
    let mut resource = JobResource::for_kind(&args.group, &args.api_version, watched);
    if let Some(plural) = &args.plural {
        resource = resource.with_plural(plural);
    }

    let client = trellis_kubehub::connect().await?;
    let source = KubeJobSource::new(client.clone(), resource.clone(), args.watch_namespace.as_deref(), args.watch_timeout_secs);
    let registry = JobRegistry::new(Arc::new(KubeCluster::new(client)), kinds, &config);
    info!(
        group = %resource.group,
        plural = %resource.plural,
        watch_ns = ?args.watch_namespace,
        kinds = ?config.kinds,
        "controller starting"
    );
    let mut control = ControlLoop::new(source, registry, &config);
    control.run(shutdown_signal()).await;
    info!("controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => info!("interrupt received; shutting down"),
        _ = terminate => info!("SIGTERM received; shutting down"),
    }
}

#[derive(Debug, Serialize)]
struct RenderedReplica {
    name: String,
    replica_type: &'static str,
    index: u32,
    env: Vec<EnvVar>,
    ports: Vec<i32>,
    pod: Pod,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<Service>,
}

#[derive(Debug, Serialize)]
struct Rendered {
    name: String,
    namespace: String,
    kind: &'static str,
    pods: u64,
    services: u64,
    replicas: Vec<RenderedReplica>,
}

fn load_job(text: &str, default_namespace: &str) -> Result<Job> {
    let doc: Value = serde_yaml::from_str(text).context("parsing manifest")?;
    let kind = doc.get("kind").and_then(Value::as_str).context("manifest has no kind")?;
    let name = doc.pointer("/metadata/name").and_then(Value::as_str).context("manifest has no metadata.name")?;
    let namespace = doc.pointer("/metadata/namespace").and_then(Value::as_str).unwrap_or(default_namespace);
    let spec = doc.get("spec").context("manifest has no spec")?;
    let kind = KindRegistry::all().resolve(kind)?;
    Ok(Job::new(name, namespace, kind, spec, BackoffPolicy::default())?)
}

/// Expand a manifest and reconcile it against an in-memory cluster.
async fn render(text: &str, default_namespace: &str) -> Result<Rendered> {
    let mut job = load_job(text, default_namespace)?;
    let cluster = MemoryCluster::new();
    job.reconcile(&cluster).await?;
    let stats = cluster.stats();
    let replicas = job
        .replicas()
        .iter()
        .map(|r| RenderedReplica {
            name: r.name().to_string(),
            replica_type: r.role().as_str(),
            index: r.uid(),
            env: r.params().env.clone(),
            ports: r.params().ports.to_vec(),
            pod: r.pod().clone(),
            service: r.service().cloned(),
        })
        .collect();
    Ok(Rendered {
        name: job.name().to_string(),
        namespace: job.namespace().to_string(),
        kind: job.kind().wire_name(),
        pods: stats.pod_creates,
        services: stats.service_creates,
        replicas,
    })
}

fn print_rendered(r: &Rendered) {
    println!("{} {}/{}: {} pod(s), {} service(s)", r.kind, r.namespace, r.name, r.pods, r.services);
    for replica in &r.replicas {
        let svc = if replica.service.is_some() { "svc" } else { "-" };
        println!("  {:<28} {:<10} {}", replica.name, replica.replica_type, svc);
        for var in &replica.env {
            println!("      {}={}", var.name, var.value);
        }
    }
}

#[derive(Debug, Serialize)]
struct KindRow {
    kind: &'static str,
    replica_types: Vec<&'static str>,
    ports: Vec<i32>,
}

fn kind_rows() -> Vec<KindRow> {
    JobKind::ALL
        .into_iter()
        .map(|kind| {
            let d = kind.descriptor();
            let ports = d.roles.first().map(|role| d.container_ports(*role).to_vec()).unwrap_or_default();
            KindRow { kind: kind.wire_name(), replica_types: d.roles.iter().map(|r| r.as_str()).collect(), ports }
        })
        .collect()
}
