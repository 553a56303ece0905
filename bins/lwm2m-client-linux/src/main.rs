use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lwm2m_client::{Client, ClientEvent, ResourcePath};
use lwm2m_core::{ClientConfig, MemoryStore};

const REBOOT: ResourcePath = ResourcePath::resource(3, 0, 4);

#[derive(Debug, Parser)]
#[command(name = "lwm2m-client", version, about = "LwM2M client over CoAP/UDP")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "LWM2M_CONFIG")]
    config: Option<PathBuf>,

    /// Objects file populating the resource store (overrides objectsDefinitions)
    #[arg(short, long, env = "LWM2M_OBJECTS")]
    objects: Option<PathBuf>,

    #[arg(long, env = "LWM2M_SERVER_HOST")]
    server_host: Option<String>,

    #[arg(long, env = "LWM2M_SERVER_PORT")]
    server_port: Option<u16>,

    /// Endpoint client name
    #[arg(short, long, env = "LWM2M_ENDPOINT")]
    endpoint: Option<String>,

    /// Log filter, e.g. "debug" or "info,lwm2m_client=trace"
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(host) = args.server_host {
        config.server_host = host;
    }
    if let Some(port) = args.server_port {
        config.server_port = port;
    }
    if let Some(endpoint) = args.endpoint {
        config.client_name = endpoint;
    }

    let filter = args.log_level.unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("LwM2M client starting...");

    let objects = args
        .objects
        .unwrap_or_else(|| PathBuf::from(&config.objects_definitions));
    let store = load_store(&objects, &config)?;

    let client = Client::builder(config)
        .store(store)
        .on_execute(REBOOT, |path: ResourcePath, _args: String| {
            tracing::warn!("Reboot requested through {}", path);
            Ok::<(), lwm2m_client::ResourceError>(())
        })
        .start()
        .await?;

    let mut events = client.events();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::StateChanged { from, to } => tracing::info!("State {} -> {}", from, to),
                ClientEvent::Registered { location } => tracing::info!("Registered at /{}", location),
                ClientEvent::Deregistered => tracing::info!("Deregistered"),
                ClientEvent::Error(e) => tracing::error!("Client error: {}", e),
                ClientEvent::ObjectEvent { operation, path, .. } => {
                    tracing::debug!("Object {} on {}", operation, path)
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down...");

    client.stop().await?;
    event_log.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Build the resource store from the objects file, or from the built-in
/// Server and Device objects when the file does not exist.
fn load_store(path: &Path, config: &ClientConfig) -> anyhow::Result<MemoryStore> {
    if !path.exists() {
        tracing::warn!("Objects file {} not found, using built-in objects", path.display());
        return Ok(lwm2m_client::default_store(config));
    }

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading objects file {}", path.display()))?;
    let mut store = MemoryStore::from_objects_json(&json)
        .with_context(|| format!("parsing objects file {}", path.display()))?;
    tracing::info!("Loaded {} resources from {}", store.path_count(), path.display());
    lwm2m_client::seed_lifetime(&mut store, config);
    Ok(store)
}
