use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kubemod_apply::{ApplyOptions, State, WaitSpec};
use kubemod_core::{ConditionMatch, Report, ResourceDefinition, ResourceId};
use kubemod_helm::KubeConnection;
use kubemod_kubehub::KubeClient;
use kubemod_ops::{InfoQuery, InfoWait, ScaleRequest};
use serde_json::Value as Json;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kubemodctl", version, about = "Declarative Kubernetes operations")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Json)]
    output: Output,

    /// Kubernetes namespace (default: from the definition, then the current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Report what would change without mutating the cluster
    #[arg(long = "check", global = true, action = ArgAction::SetTrue)]
    check: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StateArg { Present, Absent }

#[derive(Args, Debug, Clone)]
struct WaitArgs {
    /// Wait for the object after the operation
    #[arg(long = "wait", action = ArgAction::SetTrue)]
    wait: bool,
    /// Condition type to wait for, e.g. "Available"
    #[arg(long = "wait-condition")]
    condition: Option<String>,
    /// Expected condition status
    #[arg(long = "wait-status", default_value = "True")]
    status: String,
    /// Expected condition reason
    #[arg(long = "wait-reason")]
    reason: Option<String>,
    /// Seconds between polls
    #[arg(long = "wait-sleep", env = "KUBEMOD_WAIT_SLEEP_SECS", default_value_t = 5)]
    sleep: u64,
    /// Seconds before giving up
    #[arg(long = "wait-timeout", default_value_t = 20)]
    timeout: u64,
}

impl WaitArgs {
    fn condition(&self) -> Option<ConditionMatch> {
        self.condition.as_deref().map(|t| ConditionMatch { type_: t.to_string(), status: self.status.clone(), reason: self.reason.clone() })
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the content hash of a ConfigMap or Secret
    Hash {
        /// Definition file (YAML or JSON)
        #[arg(short = 'f', long = "file")]
        file: String,
    },
    /// Create, update or delete the object in a definition file
    Apply {
        #[arg(short = 'f', long = "file")]
        file: String,
        #[arg(long = "state", value_enum, default_value_t = StateArg::Present)]
        state: StateArg,
        /// Replace instead of patching
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
        /// Append the content hash to ConfigMap/Secret names
        #[arg(long = "append-hash", action = ArgAction::SetTrue)]
        append_hash: bool,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Scale a Deployment, ReplicaSet, StatefulSet, ReplicationController or Job
    Scale {
        /// Definition file naming the target
        #[arg(short = 'f', long = "file")]
        src: Option<String>,
        /// Inline definition (YAML or JSON) naming the target
        #[arg(long = "definition")]
        definition: Option<String>,
        /// GVK key, e.g. "apps/v1/Deployment"
        #[arg(long = "kind")]
        gvk: Option<String>,
        #[arg(long = "name")]
        name: Option<String>,
        #[arg(long = "replicas")]
        replicas: i64,
        /// Only scale when the live count equals this
        #[arg(long = "current-replicas")]
        current_replicas: Option<i64>,
        /// Only scale when the live resourceVersion equals this
        #[arg(long = "resource-version")]
        resource_version: Option<String>,
        /// Do not wait for replicas to become ready
        #[arg(long = "no-wait", action = ArgAction::SetTrue)]
        no_wait: bool,
        #[arg(long = "wait-sleep", env = "KUBEMOD_WAIT_SLEEP_SECS", default_value_t = 5)]
        wait_sleep: u64,
        #[arg(long = "wait-timeout", default_value_t = 20)]
        wait_timeout: u64,
    },
    /// Roll a Deployment or DaemonSet back to its previous revision
    Rollback {
        /// GVK key, e.g. "apps/v1/Deployment"
        #[arg(long = "kind")]
        gvk: String,
        #[arg(long = "name", conflicts_with = "selector")]
        name: Option<String>,
        /// Roll back every match of this label selector
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Read objects, optionally waiting on a condition
    Info {
        /// GVK key, e.g. "v1/Pod"
        #[arg(long = "kind")]
        gvk: String,
        #[arg(long = "name")]
        name: Option<String>,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Run helm with the connection translated into its environment
    Helm {
        #[arg(long = "helm-bin", env = "KUBEMOD_HELM_BIN", default_value = "helm")]
        binary: String,
        #[arg(long = "host")]
        host: Option<String>,
        #[arg(long = "api-key")]
        api_key: Option<String>,
        #[arg(long = "context")]
        context: Option<String>,
        #[arg(long = "kubeconfig")]
        kubeconfig: Option<String>,
        #[arg(long = "ca-cert")]
        ca_cert: Option<String>,
        #[arg(long = "validate-certs", default_value_t = true, action = ArgAction::Set)]
        validate_certs: bool,
        /// Arguments passed to helm
        #[arg(last = true)]
        args: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KUBEMOD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBEMOD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KUBEMOD_METRICS_ADDR; expected host:port");
        }
    }
}

fn gvk(key: &str) -> kubemod_core::Result<(String, String)> {
    kubemod_ops::parse_gvk_key(key).ok_or_else(|| kubemod_core::Error::InvalidDefinition(format!("invalid GVK key {:?}; expected group/version/Kind or version/Kind", key)))
}

fn read_definition(path: &str, ns: Option<&str>) -> kubemod_core::Result<ResourceDefinition> {
    let text = std::fs::read_to_string(path)?;
    kubemod_apply::parse_definition(&text, ns)
}

// Helm subcommands that only read cluster state.
const HELM_READ_ONLY: [&str; 10] = ["env", "get", "history", "lint", "list", "search", "show", "status", "template", "version"];

async fn run(cli: &Cli) -> kubemod_core::Result<Report> {
    let ns = cli.namespace.as_deref();
    match &cli.command {
        Commands::Hash { file } => {
            let text = std::fs::read_to_string(file)?;
            let val: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|e| kubemod_core::Error::InvalidDefinition(format!("parsing YAML: {}", e)))?;
            let hash = kubemod_core::generate_hash(&serde_json::to_value(val)?)?;
            Ok(Report::unchanged(Some(serde_json::json!({ "hash": hash.as_str() }))))
        }
        Commands::Apply { file, state, force, append_hash, wait } => {
            let def = read_definition(file, ns)?;
            let opts = ApplyOptions {
                state: match state { StateArg::Present => State::Present, StateArg::Absent => State::Absent },
                force: *force,
                check_mode: cli.check,
                append_hash: *append_hash,
                wait: wait.wait.then(|| WaitSpec { condition: wait.condition(), sleep: Duration::from_secs(wait.sleep), timeout: Duration::from_secs(wait.timeout) }),
            };
            let client = KubeClient::try_default().await?;
            kubemod_apply::apply(&client, def, &opts).await
        }
        Commands::Scale { src, definition, gvk: key, name, replicas, current_replicas, resource_version, no_wait, wait_sleep, wait_timeout } => {
            let src = src.as_deref().map(|p| read_definition(p, None)).transpose()?;
            let definition = definition.as_deref().map(|d| kubemod_apply::parse_definition(d, None)).transpose()?;
            let explicit = match (key, name) {
                (Some(k), Some(n)) => {
                    let (api_version, kind) = gvk(k)?;
                    Some(ResourceId::new(&api_version, &kind, ns, n))
                }
                _ => None,
            };
            let target = kubemod_ops::resolve_target(definition, src, explicit, ns)?;
            let mut req = ScaleRequest::new(target, *replicas);
            req.current_replicas = *current_replicas;
            req.resource_version = resource_version.clone();
            req.wait = !no_wait;
            req.wait_sleep = Duration::from_secs(*wait_sleep);
            req.wait_timeout = Duration::from_secs(*wait_timeout);
            req.check_mode = cli.check;
            let client = KubeClient::try_default().await?;
            kubemod_ops::scale(&client, &req).await
        }
        Commands::Rollback { gvk: key, name, selector } => {
            let (api_version, kind) = gvk(key)?;
            let client = KubeClient::try_default().await?;
            match name {
                Some(n) => kubemod_ops::rollback(&client, &ResourceId::new(&api_version, &kind, ns, n), cli.check).await,
                None => kubemod_ops::rollback_matching(&client, &api_version, &kind, ns, selector.as_deref(), cli.check).await,
            }
        }
        Commands::Info { gvk: key, name, selector, wait } => {
            let (api_version, kind) = gvk(key)?;
            let query = InfoQuery { api_version, kind, namespace: cli.namespace.clone(), name: name.clone(), label_selector: selector.clone() };
            let wait = wait.wait.then(|| InfoWait { condition: wait.condition(), sleep: Duration::from_secs(wait.sleep), timeout: Duration::from_secs(wait.timeout) });
            let client = KubeClient::try_default().await?;
            kubemod_ops::info(&client, &query, wait.as_ref()).await
        }
        Commands::Helm { binary, host, api_key, context, kubeconfig, ca_cert, validate_certs, args } => {
            let conn = KubeConnection {
                host: host.clone(),
                api_key: api_key.clone(),
                context: context.clone(),
                namespace: cli.namespace.clone(),
                kubeconfig: kubeconfig.clone(),
                ca_cert: ca_cert.clone(),
                validate_certs: *validate_certs,
            };
            let read_only = args.first().map(|a| HELM_READ_ONLY.contains(&a.as_str())).unwrap_or(true);
            if cli.check && !read_only {
                return Ok(Report::changed(None).with_msg(format!("would run {} {}", binary, args.join(" "))));
            }
            let out = kubemod_helm::run_helm(binary, args, &conn).await?;
            let result = Some(serde_json::to_value(&out)?);
            Ok(if read_only { Report::unchanged(result) } else { Report::changed(result) })
        }
    }
}

fn print_human(report: &Report) -> Result<()> {
    println!("changed: {}", report.changed);
    if let Some(msg) = &report.msg {
        println!("msg: {}", msg);
    }
    if let Some(d) = report.duration {
        println!("duration: {:.1}s", d);
    }
    for c in &report.diff {
        let render = |v: &Option<Json>| v.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
        println!("  {} {} -> {}", c.path, render(&c.old), render(&c.new));
    }
    if let Some(result) = &report.result {
        print!("{}", serde_yaml::to_string(result)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let started = Instant::now();
    match run(&cli).await {
        Ok(report) => {
            info!(changed = report.changed, elapsed_ms = %started.elapsed().as_millis(), "done");
            match cli.output {
                Output::Human => print_human(&report)?,
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, kind = e.kind_name(), "operation failed");
            let failure = e.to_failure();
            match cli.output {
                Output::Human => eprintln!("error: {}", failure.msg),
                Output::Json => println!("{}", serde_json::to_string_pretty(&failure)?),
            }
            std::process::exit(1);
        }
    }
}
