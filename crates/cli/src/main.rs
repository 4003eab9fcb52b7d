use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kfn_core::{Function, ObjectKey};
use kfn_kubehub::ControllerConfig;
use kfn_reconcile::ReconcilerConfig;
use kfn_render::{bind_children, resolve, RenderConfig};
use kube::CustomResourceExt;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kfnctl", version, about = "kfn Function controller")]
struct Cli {
    /// Output format for printed manifests
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Yaml)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Yaml,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context
    Run(RunArgs),
    /// Print the Function CustomResourceDefinition
    Crd,
    /// Print the ConfigMap, Service and Deployment a Function manifest resolves to
    Render {
        /// Function manifest (YAML or JSON)
        file: PathBuf,
        /// Namespace used when the manifest has none
        #[arg(long, default_value = "default")]
        namespace: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Watch only this namespace (default: all namespaces)
    #[arg(long, env = "KFN_NAMESPACE")]
    namespace: Option<String>,
    /// Serve Prometheus metrics on host:port
    #[arg(long, env = "KFN_METRICS_ADDR")]
    metrics_addr: Option<String>,
    /// Image of the init container that compiles the handler
    #[arg(long, env = "KFN_BUILDER_IMAGE", default_value = "ghcr.io/hooksie1/goless-builder")]
    builder_image: String,
    /// Image of the container that serves the compiled handler
    #[arg(long, env = "KFN_SERVER_IMAGE", default_value = "ghcr.io/hooksie1/goless-server")]
    server_image: String,
    /// Re-check delay while a Function's workload is not ready
    #[arg(long, env = "KFN_BUILDING_REQUEUE_SECS", default_value_t = 20)]
    building_requeue_secs: u64,
    /// Retry delay after a transient reconcile error
    #[arg(long, env = "KFN_ERROR_REQUEUE_SECS", default_value_t = 5)]
    error_requeue_secs: u64,
    /// Deadline for the API calls of one pass; 0 disables it
    #[arg(long, env = "KFN_CALL_TIMEOUT_SECS", default_value_t = 30)]
    call_timeout_secs: u64,
}

impl RunArgs {
    fn controller_config(&self) -> ControllerConfig {
        let render = RenderConfig {
            builder_image: self.builder_image.clone(),
            server_image: self.server_image.clone(),
            ..Default::default()
        };
        ControllerConfig {
            namespace: self.namespace.clone(),
            reconciler: ReconcilerConfig { render, building_requeue: Duration::from_secs(self.building_requeue_secs) },
            call_timeout: (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs)),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
            ..Default::default()
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KFN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    if let Some(addr) = addr {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid metrics address; expected host:port");
        }
    }
}

fn print_doc<T: serde::Serialize>(value: &T, output: Output) -> Result<()> {
    match output {
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn load_function(path: &Path, namespace: &str) -> Result<Function> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut function: Function =
        serde_yaml::from_str(&text).with_context(|| format!("parsing Function from {}", path.display()))?;
    if function.metadata.namespace.is_none() {
        function.metadata.namespace = Some(namespace.to_string());
    }
    Ok(function)
}

fn render(function: &Function, output: Output) -> Result<()> {
    let key = ObjectKey::of(function).context("Function manifest needs metadata.name")?;
    let mut desired = resolve(&key, &function.spec, &RenderConfig::default());
    // Owner references need the live uid; manifests read from disk usually have none.
    if function.metadata.uid.is_some() {
        bind_children(function, &mut desired)?;
    }
    print_doc(&desired.artifact, output)?;
    if output == Output::Yaml {
        println!("---");
    }
    print_doc(&desired.network, output)?;
    if output == Output::Yaml {
        println!("---");
    }
    print_doc(&desired.workload, output)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_metrics(args.metrics_addr.as_deref());
            let config = args.controller_config();
            info!(ns = ?config.namespace, builder = %args.builder_image, server = %args.server_image, "starting controller");
            let client = kfn_kubehub::get_kube_client().await.context("building kube client")?;
            kfn_kubehub::run_controller(client, config).await?;
        }
        Commands::Crd => print_doc(&Function::crd(), cli.output)?,
        Commands::Render { file, namespace } => {
            let function = load_function(&file, &namespace)?;
            render(&function, cli.output)?;
        }
    }
    Ok(())
}
