use std::path::PathBuf;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use csi_proxy::csi::controller_server::ControllerServer;
use csi_proxy::csi::identity_server::IdentityServer;
use csi_proxy::csi::node_server::NodeServer;
use csi_proxy::identity::DRIVER_NAME;
use csi_proxy::metrics;
use csi_proxy::types::ListenAddr;
use csi_proxy::{
    ConnectionCache, ControllerService, DriverFactory, DriverOptions, IdentityService, KindCache,
    NodeService,
};

#[derive(Parser, Debug)]
#[command(name = "csi-proxy")]
#[command(about = "Multiplexing CSI proxy in front of many storage connections")]
struct Args {
    /// Proxy options file (YAML)
    #[arg(long, env = "PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// CSI endpoint (unix:///path or tcp://host:port)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    endpoint: String,

    /// Plugin name reported by the identity service
    #[arg(long, default_value = DRIVER_NAME)]
    csi_name: String,

    /// Serve the controller service
    #[arg(long)]
    controller: bool,

    /// Serve the node service
    #[arg(long)]
    node: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let base = match &args.config {
        Some(path) => DriverOptions::load(path)
            .await
            .map_err(|e| format!("Failed to load {}: {}", path.display(), e))?,
        None => DriverOptions::default(),
    };
    let listen: ListenAddr = args.endpoint.parse()?;

    // neither flag means both services
    let (serve_controller, serve_node) = match (args.controller, args.node) {
        (false, false) => (true, true),
        flags => flags,
    };

    let factory = DriverFactory::with_builtin();
    let connections = ConnectionCache::from_options(base.clone(), factory.clone());

    info!(
        csi_name = %args.csi_name,
        endpoint = %listen,
        config_folder = %base.proxy.config_folder.display(),
        cache_policy = ?connections.policy(),
        controller = serve_controller,
        node = serve_node,
        "Starting CSI proxy"
    );

    let controller = serve_controller
        .then(|| ControllerServer::new(ControllerService::new(connections.clone())));

    let node = if serve_node {
        let drivers = KindCache::new(base.clone(), factory.clone());
        let service = NodeService::new(drivers, connections.clone(), &base.proxy);
        match service.node_info() {
            Ok(node_info) => info!(node_id = %node_info.node_id, "Node identity"),
            Err(e) => warn!(error = %e, "Node identity is not available yet"),
        }
        Some(NodeServer::new(service))
    } else {
        None
    };

    let router = Server::builder()
        .add_service(IdentityServer::new(IdentityService::new(args.csi_name)))
        .add_optional_service(controller)
        .add_optional_service(node);

    match listen {
        ListenAddr::Unix(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // a socket left behind by a previous run blocks bind
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "Removed stale socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            let incoming = UnixListenerStream::new(UnixListener::bind(&path)?);
            info!(path = %path.display(), "gRPC server listening");
            router
                .serve_with_incoming_shutdown(incoming, shutdown_signal())
                .await?;
        }
        ListenAddr::Tcp(addr) => {
            info!(%addr, "gRPC server listening");
            router.serve_with_shutdown(addr, shutdown_signal()).await?;
        }
    }

    info!("csi-proxy shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
    info!("Shutdown signal received, draining connections...");
}
