use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::raft::RaftNode;
use crate::state_machine::StateMachine;

/// Small HTTP surface for health checks and operator inspection. Reads the
/// consensus and state machine views directly; never goes through the log.
#[derive(Clone)]
struct StatusState {
    node: Arc<RaftNode>,
    state_machine: Arc<StateMachine>,
}

pub fn status_router(node: Arc<RaftNode>, state_machine: Arc<StateMachine>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(status))
        .with_state(StatusState {
            node,
            state_machine,
        })
}

async fn status(State(state): State<StatusState>) -> Json<serde_json::Value> {
    let raft = state.node.status().await;
    let is_leader = raft.role == crate::raft::NodeRole::Leader;
    let snapshot = state.state_machine.snapshot();
    Json(json!({
        "raft": raft,
        "is_leader": is_leader,
        "movies": snapshot.movies.len(),
        "bookings": snapshot.bookings.len(),
        "payments": snapshot.payments.len(),
    }))
}

pub async fn serve(
    addr: SocketAddr,
    node: Arc<RaftNode>,
    state_machine: Arc<StateMachine>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "status endpoint listening");
    axum::serve(listener, status_router(node, state_machine)).await?;
    Ok(())
}
