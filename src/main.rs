use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use kube::api::{Api, ListParams};
use multi_vpc_operator::config::ConnectionScripts;
use multi_vpc_operator::crd::{VpcConnection, VpcDns, VpcNatTunnel};
use multi_vpc_operator::{controller, Error, OperatorConfig};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Count the managed resources in the cluster
    Info,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace of the VPC NAT gateway StatefulSets and pods
    #[arg(long, env = "GATEWAY_NAMESPACE", default_value = "kube-system")]
    gateway_namespace: String,

    /// Container in the gateway pod that runs tunnel commands
    #[arg(long, env = "GATEWAY_CONTAINER", default_value = "vpc-nat-gw")]
    gateway_container: String,

    /// Namespace of the cluster DNS service and the vpc-dns deployments
    #[arg(long, env = "DNS_NAMESPACE", default_value = "kube-system")]
    dns_namespace: String,

    #[arg(long, env = "DNS_SERVICE", default_value = "kube-dns")]
    dns_service: String,

    #[arg(long, env = "COREFILE_CONFIG_MAP", default_value = "vpc-dns-corefile")]
    corefile_config_map: String,

    /// Domain forwarded from every VPC to the cluster DNS service
    #[arg(long, env = "CROSS_NETWORK_DOMAIN", default_value = "clusterset.local")]
    cross_network_domain: String,

    /// Name the DNS probe resolves; its answer must contain the DNS service IP
    #[arg(long, env = "PROBE_QUERY", default_value = "no.ns1.svc.clusterset.local")]
    probe_query: String,

    #[arg(long, env = "PROBE_IMAGE", default_value = "nicolaka/netshoot")]
    probe_image: String,

    /// Seconds to wait before reading the probe pod's log
    #[arg(long, env = "PROBE_SETTLE_SECS", default_value_t = 10)]
    probe_settle_secs: u64,

    /// Seconds between probes of a converged VpcDns
    #[arg(long, env = "DNS_RECHECK_SECS", default_value_t = 300)]
    dns_recheck_secs: u64,

    /// Seconds between probes while forwarding is being wired up
    #[arg(long, env = "DNS_PENDING_RECHECK_SECS", default_value_t = 30)]
    dns_pending_recheck_secs: u64,

    #[arg(long, env = "EXEC_TIMEOUT_SECS", default_value_t = 30)]
    exec_timeout_secs: u64,

    /// Requeue delay when a gateway pod is ambiguous or not running
    #[arg(long, env = "POD_BACKOFF_SECS", default_value_t = 5)]
    pod_backoff_secs: u64,

    #[arg(long, env = "ERROR_REQUEUE_SECS", default_value_t = 15)]
    error_requeue_secs: u64,

    /// Maximum concurrent reconciles per controller
    #[arg(long, env = "CONCURRENCY", default_value_t = 5)]
    concurrency: u16,

    /// Directory holding create.sh and delete.sh
    #[arg(long, env = "SCRIPTS_DIR", default_value = "./conf")]
    scripts_dir: PathBuf,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Listen address of the health and metrics endpoint
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,
}

impl RunArgs {
    fn operator_config(&self, scripts: ConnectionScripts) -> OperatorConfig {
        OperatorConfig {
            gateway_namespace: self.gateway_namespace.clone(),
            gateway_container: self.gateway_container.clone(),
            dns_namespace: self.dns_namespace.clone(),
            dns_service: self.dns_service.clone(),
            corefile_config_map: self.corefile_config_map.clone(),
            cross_network_domain: self.cross_network_domain.clone(),
            probe_query: self.probe_query.clone(),
            probe_image: self.probe_image.clone(),
            probe_settle: Duration::from_secs(self.probe_settle_secs),
            dns_recheck: Duration::from_secs(self.dns_recheck_secs),
            dns_pending_recheck: Duration::from_secs(self.dns_pending_recheck_secs),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            pod_backoff: Duration::from_secs(self.pod_backoff_secs),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
            concurrency: self.concurrency,
            scripts,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Multi-VPC Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info => run_info().await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_info() -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    let lp = ListParams::default();

    let tunnels = Api::<VpcNatTunnel>::all(client.clone()).list(&lp).await?;
    let connections = Api::<VpcConnection>::all(client.clone()).list(&lp).await?;
    let dns = Api::<VpcDns>::all(client).list(&lp).await?;

    println!("VpcNatTunnels:  {}", tunnels.items.len());
    println!("VpcConnections: {}", connections.items.len());
    println!("VpcDns:         {}", dns.items.len());
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let (text_layer, json_layer) = match format {
        LogFormat::Text => (Some(fmt::layer().with_target(true)), None),
        LogFormat::Json => (None, Some(fmt::layer().json().with_target(true))),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer);

    // Only enable OTEL if an endpoint is provided
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let otel_layer = multi_vpc_operator::telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!(
        "Starting Multi-VPC Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let scripts = ConnectionScripts::load(&args.scripts_dir)?;
    info!("Loaded connection scripts from {}", args.scripts_dir.display());
    let config = args.operator_config(scripts);

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let state = Arc::new(controller::ControllerState::new(client, config));

    #[cfg(feature = "rest-api")]
    {
        let addr = args.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = multi_vpc_operator::rest_api::run_server(addr).await {
                tracing::error!("Metrics server error: {:?}", e);
            }
        });
    }

    // Controllers stop on SIGTERM/SIGINT; the watcher only stops if its stream ends
    let controllers = async {
        tokio::try_join!(
            controller::run_tunnel_controller(state.clone()),
            controller::run_connection_controller(state.clone()),
            controller::run_dns_controller(state.clone()),
        )
        .map(|_| ())
    };

    let result = tokio::select! {
        res = controllers => res,
        res = controller::run_gateway_watcher(state.clone()) => res,
    };

    // Flush any remaining traces
    multi_vpc_operator::telemetry::shutdown_telemetry();

    result
}
