use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kad_logic::config::SystemConfig;
use kad_logic::{Id, InMemoryValueStore, KademliaDht};
use kad_transport::{ShutdownSender, TcpSender};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stand-alone Kademlia node")]
struct Cli {
    /// Address to accept RPCs on.
    #[arg(long, default_value = "127.0.0.1:3030")]
    listen: SocketAddr,

    /// Address of an existing node to join through. May be repeated.
    #[arg(long = "bootstrap")]
    bootstrap: Vec<SocketAddr>,

    /// This node's id, as hex. A random one is drawn if omitted.
    #[arg(long)]
    id: Option<String>,

    /// Increase log verbosity; repeat for more (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "kad_server=info,kad_logic=info,kad_transport=info",
        1 => "kad_server=debug,kad_logic=debug,kad_transport=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut rng = rand::thread_rng();
    let id = match cli.id {
        Some(hex) => Id::from_hex(&hex),
        None => Id::random(&mut rng),
    };
    info!(?id, listen = %cli.listen, "starting node");

    let dht = Arc::new(KademliaDht::new(
        SystemConfig::default(),
        id,
        cli.listen.port(),
        TcpSender,
        InMemoryValueStore::new(Default::default()),
    ));

    let shutdown = ShutdownSender::new();
    let server = tokio::spawn(kad_transport::serve(
        cli.listen,
        dht.clone(),
        shutdown.subscribe().into(),
    ));

    for addr in &cli.bootstrap {
        info!(%addr, "bootstrapping");
        dht.bootstrap(*addr, &mut rng).await;
    }
    info!(routed = dht.routing_table_len(), "bootstrap finished");

    let maintenance_dht = dht.clone();
    let mut maintenance_shutdown = shutdown.subscribe();
    let maintenance = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => maintenance_dht.run_maintenance().await,
                _ = maintenance_shutdown.recv() => break,
            }
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for ctrl-c, shutting down anyway");
    }
    info!("shutting down");
    shutdown.shutdown();

    let _ = maintenance.await;
    match server.await {
        Ok(Err(err)) => warn!(%err, "server exited with an error"),
        Err(err) => warn!(%err, "server task panicked"),
        Ok(Ok(())) => {}
    }
}
