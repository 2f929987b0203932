use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ticketd::assist::AssistClient;
use ticketd::auth::AuthService;
use ticketd::config::Config;
use ticketd::raft::grpc::{GrpcTransport, RaftGrpcService};
use ticketd::raft::{RaftNode, RaftTiming};
use ticketd::router::RequestRouter;
use ticketd::state_machine::StateMachine;
use ticketd::status;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ticketd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path)?
    } else {
        warn!(path = %config_path, "config file not found, using defaults");
        Config::default()
    };

    let auth = Arc::new(AuthService::new(&config.jwt_secret, config.token_ttl_hours));
    let state_machine = Arc::new(StateMachine::new());
    let transport = Arc::new(GrpcTransport::new(config.peers.clone()));
    let node = RaftNode::new(
        config.node_id.clone(),
        config.peers.keys().cloned().collect(),
        transport,
        Arc::clone(&state_machine),
        RaftTiming::from_config(&config),
    );
    node.start();

    let peer_addr: SocketAddr =
        format!("{}:{}", config.bind_address, config.peer_port).parse()?;
    let client_addr: SocketAddr =
        format!("{}:{}", config.bind_address, config.client_port).parse()?;
    let status_addr: SocketAddr =
        format!("{}:{}", config.bind_address, config.status_port).parse()?;

    let assist = config.assist_addr.as_deref().map(AssistClient::new);
    let router = RequestRouter::new(
        &config,
        Arc::clone(&node),
        Arc::clone(&state_machine),
        auth,
        assist,
    );

    info!(
        node_id = %config.node_id,
        %peer_addr,
        %client_addr,
        %status_addr,
        peers = config.peers.len(),
        "ticketd replica starting"
    );

    let raft_server = tonic::transport::Server::builder()
        .add_service(RaftGrpcService::new(Arc::clone(&node)).into_server())
        .serve(peer_addr);
    let client_server = tonic::transport::Server::builder()
        .add_service(router.into_server())
        .serve(client_addr);
    let status_server = status::serve(status_addr, Arc::clone(&node), state_machine);

    tokio::select! {
        result = raft_server => result?,
        result = client_server => result?,
        result = status_server => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            node.shutdown();
        }
    }

    Ok(())
}
