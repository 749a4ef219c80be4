use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_api::{ClusterControl, Compliance, InProcControl, KubeOps, ManifestEngine, ManifestOutcome, WorkloadKind};
use keel_core::prelude::*;
use keel_core::LogLevel;
use kube::core::DynamicObject;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel cluster control CLI")]
struct Cli {
    /// API server endpoint; `https://` is assumed when no scheme is given
    #[arg(long, env = "KEEL_SERVER", global = true)]
    server: Option<String>,

    /// Bearer token
    #[arg(long, env = "KEEL_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Verify the server certificate (skipped by default)
    #[arg(long = "tls-verify", env = "KEEL_TLS_VERIFY", global = true, action = ArgAction::SetTrue)]
    tls_verify: bool,

    /// Kubernetes namespace
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// panic|fatal|error|warn|info|debug|trace; ignored when KEEL_LOG is set
    #[arg(long = "log-level", env = "LOG_LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Server-side apply manifests from files, directories or `-` for stdin
    Apply {
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
    },
    /// Delete the objects described by manifests (background cascade)
    Delete {
        #[arg(short = 'f', long = "filename", required = true)]
        files: Vec<PathBuf>,
    },
    /// Read objects of any kind by resource key
    Get {
        /// Resource key, e.g. "v1/services" or "apps/v1/deployments"
        gvr: String,
        /// Object name; lists the collection when omitted
        name: Option<String>,
        /// Address cluster-scoped kinds, or list across all namespaces
        #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
        all_namespaces: bool,
    },
    /// Rolling restart of a workload
    Restart {
        name: String,
        /// deployment|daemonset|statefulset
        #[arg(long, default_value = "deployment")]
        kind: WorkloadKind,
    },
    /// Deployments selected by a service's selector
    Backends { service: String },
    /// Services whose selector contains the given labels
    Services {
        /// Comma separated `key=value` pairs
        #[arg(short = 'l', long = "selector", default_value = "")]
        selector: String,
    },
    /// Report whether a CRD is installed
    CrdExists { name: String },
    /// Verify every node runs the approved container runtime
    CheckRuntime {
        /// Overrides KEEL_APPROVED_RUNTIME
        #[arg(long)]
        approved: Option<String>,
    },
    /// List namespaces
    Namespaces,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match std::env::var("KEEL_LOG") {
        Ok(env) => tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        Err(_) => tracing_subscriber::EnvFilter::new(LogLevel::from_setting(log_level).level_filter().to_string()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Parses `app=web,tier=fe`. Empty input is the empty map.
fn parse_labels(raw: &str) -> Result<LabelMap> {
    let mut labels = LabelMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').ok_or_else(|| anyhow!("invalid label {:?}; expected key=value", pair))?;
        if k.trim().is_empty() {
            bail!("invalid label {:?}; empty key", pair);
        }
        labels.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(labels)
}

fn profile_from(cli: &Cli) -> Result<ConnectionProfile> {
    let server = cli.server.clone().ok_or_else(|| anyhow!("--server or KEEL_SERVER is required"))?;
    let token = cli.token.clone().unwrap_or_default();
    let tls = if cli.tls_verify { TlsPolicy::Verify } else { TlsPolicy::SkipVerify };
    Ok(ConnectionProfile::new(server, token).with_tls_policy(tls))
}

fn print_outcome(verb: &str, outcome: &ManifestOutcome, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for obj in &outcome.objects {
                println!("{} {}", obj, verb);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(outcome)?),
    }
    Ok(())
}

fn print_objects(items: &[DynamicObject], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<20} {:<40} {}", "NAMESPACE", "NAME", "KIND");
            for item in items {
                let ns = item.metadata.namespace.as_deref().unwrap_or("-");
                let name = item.metadata.name.as_deref().unwrap_or("-");
                let kind = item.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("-");
                println!("{:<20} {:<40} {}", ns, name, kind);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

fn read_stdin() -> Result<String> {
    let mut text = String::new();
    std::io::stdin().read_to_string(&mut text).context("reading manifest from stdin")?;
    Ok(text)
}

async fn manifests(api: &dyn ClusterControl, files: &[PathBuf], delete: bool) -> Result<ManifestOutcome> {
    let stdin = PathBuf::from("-");
    let (piped, paths): (Vec<_>, Vec<_>) = files.iter().cloned().partition(|p| *p == stdin);
    let mut outcome = ManifestOutcome::default();
    if !piped.is_empty() {
        let text = read_stdin()?;
        let res = if delete { api.delete_content(&text).await? } else { api.apply_content(&text).await? };
        outcome.objects.extend(res.objects);
    }
    if !paths.is_empty() {
        let res = if delete { api.delete_manifests(&paths).await? } else { api.apply_manifests(&paths).await? };
        outcome.objects.extend(res.objects);
    }
    Ok(outcome)
}

async fn run(api: &dyn ClusterControl, cli: &Cli) -> Result<()> {
    let ns = cli.namespace.as_str();
    match &cli.command {
        Commands::Apply { files } => {
            info!(files = files.len(), "apply invoked");
            let outcome = manifests(api, files, false).await?;
            print_outcome("applied", &outcome, cli.output)?;
        }
        Commands::Delete { files } => {
            info!(files = files.len(), "delete invoked");
            let outcome = manifests(api, files, true).await?;
            print_outcome("deleted", &outcome, cli.output)?;
        }
        Commands::Get { gvr, name, all_namespaces } => {
            let mut coord: ResourceCoordinate = gvr.parse()?;
            if !*all_namespaces {
                coord = coord.in_namespace(ns);
            }
            info!(coord = %coord, name = ?name, "get invoked");
            match name {
                Some(name) => {
                    let coord = coord.named(name.as_str());
                    let obj = api.get_resource(&coord).await?.ok_or_else(|| anyhow!("{} not found", coord))?;
                    match cli.output {
                        Output::Human => print!("{}", serde_yaml::to_string(&obj)?),
                        Output::Json => println!("{}", serde_json::to_string_pretty(&obj)?),
                    }
                }
                None => print_objects(&api.list_resources(&coord).await?, cli.output)?,
            }
        }
        Commands::Restart { name, kind } => {
            info!(kind = %kind, ns = %ns, name = %name, "restart invoked");
            api.restart_workload(*kind, ns, name).await?;
            match cli.output {
                Output::Human => println!("{}/{} restarted", kind.as_str().to_ascii_lowercase(), name),
                Output::Json => println!("{}", serde_json::json!({ "kind": kind, "namespace": ns, "name": name, "restarted": true })),
            }
        }
        Commands::Backends { service } => {
            info!(ns = %ns, service = %service, "backends invoked");
            let deps = api
                .deployments_behind_service(ns, service)
                .await?
                .ok_or_else(|| anyhow!("service {}/{} not found", ns, service))?;
            match cli.output {
                Output::Human => {
                    for d in &deps {
                        println!("{}", d.metadata.name.as_deref().unwrap_or("-"));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&deps)?),
            }
        }
        Commands::Services { selector } => {
            let labels = parse_labels(selector)?;
            info!(ns = %ns, selector = %selector, "services invoked");
            let svcs = api.services_matching(ns, &labels).await?;
            match cli.output {
                Output::Human => {
                    for s in &svcs {
                        println!("{}", s.metadata.name.as_deref().unwrap_or("-"));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&svcs)?),
            }
        }
        Commands::CrdExists { name } => {
            let exists = api.resource_definition_exists(name).await?;
            match cli.output {
                Output::Human => println!("{}", exists),
                Output::Json => println!("{}", serde_json::json!({ "name": name, "exists": exists })),
            }
        }
        Commands::CheckRuntime { .. } => {
            let verdict = api.check_node_runtime().await?;
            match cli.output {
                Output::Human => match &verdict {
                    Compliance::Compliant { nodes_checked } => println!("compliant ({} nodes)", nodes_checked),
                    Compliance::Violation(v) => println!("violation: {}", v),
                },
                Output::Json => println!("{}", serde_json::to_string_pretty(&verdict)?),
            }
            if let Compliance::Violation(v) = verdict {
                bail!("cluster is not compliant: {}", v);
            }
        }
        Commands::Namespaces => {
            let list = api.list_namespaces().await?;
            match cli.output {
                Output::Human => {
                    for n in &list {
                        println!("{}", n.metadata.name.as_deref().unwrap_or("-"));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&list)?),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    init_metrics();

    let profile = profile_from(&cli)?;
    let mut ops = KubeOps::new(profile.clone());
    if let Commands::CheckRuntime { approved: Some(runtime) } = &cli.command {
        ops = ops.with_approved_runtime(runtime.as_str());
    }
    let api = InProcControl::with_parts(ops, ManifestEngine::new(profile));

    if let Err(e) = run(&api, &cli).await {
        error!(error = ?e, "command failed");
        eprintln!("error: {:#}", e);
        if e.downcast_ref::<ControlError>().map_or(false, ControlError::is_profile_problem) {
            eprintln!("hint: check --server/KEEL_SERVER and --token/KEEL_TOKEN");
        }
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_api::MockControl;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["keelctl", "--server", "cluster.example.com", "--token", "t"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("parse")
    }

    #[test]
    fn labels_parse() {
        let l = parse_labels("app=web, tier=fe").expect("labels");
        assert_eq!(l.get("app").map(String::as_str), Some("web"));
        assert_eq!(l.get("tier").map(String::as_str), Some("fe"));
        assert!(parse_labels("").expect("empty").is_empty());
        assert!(parse_labels("app").is_err());
        assert!(parse_labels("=web").is_err());
    }

    #[test]
    fn restart_kind_flag() {
        let c = cli(&["restart", "agent", "--kind", "ds"]);
        match c.command {
            Commands::Restart { kind, name } => {
                assert_eq!(kind, WorkloadKind::DaemonSet);
                assert_eq!(name, "agent");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn profile_defaults_to_skip_verify() {
        let p = profile_from(&cli(&["namespaces"])).expect("profile");
        assert_eq!(p.tls_policy(), TlsPolicy::SkipVerify);
        assert_eq!(p.derive_connection_config().host, "https://cluster.example.com");
        let p = profile_from(&cli(&["--tls-verify", "namespaces"])).expect("profile");
        assert_eq!(p.tls_policy(), TlsPolicy::Verify);
    }

    #[tokio::test]
    async fn restart_goes_through_the_api() {
        let mock = MockControl::new();
        run(&mock, &cli(&["--ns", "shop", "restart", "web"])).await.expect("run");
        let calls = mock.restarts.lock().expect("lock").clone();
        assert_eq!(calls, vec![(WorkloadKind::Deployment, "shop".to_string(), "web".to_string())]);
    }

    #[tokio::test]
    async fn missing_service_is_reported() {
        let mock = MockControl::new();
        let err = run(&mock, &cli(&["backends", "ghost"])).await.unwrap_err();
        assert!(err.to_string().contains("ghost"), "{}", err);
    }

    #[tokio::test]
    async fn violation_fails_the_command() {
        let mock = MockControl {
            compliance: Some(Compliance::Violation(keel_api::ComplianceViolation {
                node_name: "n2".into(),
                runtime_identifier: "docker://20.10.7".into(),
                found_scheme: "docker".into(),
                approved_runtime: "containerd".into(),
            })),
            ..MockControl::new()
        };
        let err = run(&mock, &cli(&["check-runtime"])).await.unwrap_err();
        assert!(err.to_string().contains("n2"), "{}", err);
    }
}
