//! End-to-end test over real gRPC: three full replicas on localhost, driven
//! through the booking client exactly as an external caller would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use ticketd::auth::AuthService;
use ticketd::client::BookingClient;
use ticketd::config::Config;
use ticketd::error::TicketError;
use ticketd::raft::grpc::{GrpcTransport, RaftGrpcService};
use ticketd::raft::{RaftNode, RaftTiming};
use ticketd::router::RequestRouter;
use ticketd::state_machine::StateMachine;

const CLIENT_PORTS: [u16; 3] = [61051, 61052, 61053];
const PEER_PORTS: [u16; 3] = [61061, 61062, 61063];
const JWT_SECRET: &str = "e2e-test-secret";

fn fast_timing() -> RaftTiming {
    RaftTiming {
        election_timeout_min: Duration::from_millis(300),
        election_timeout_max: Duration::from_millis(600),
        heartbeat_interval: Duration::from_millis(100),
        submit_timeout: Duration::from_secs(3),
        rpc_timeout: Duration::from_millis(500),
    }
}

async fn spawn_replica(idx: usize) -> Arc<RaftNode> {
    let node_id = format!("node{}", idx + 1);
    let mut peers = HashMap::new();
    let mut peer_routers = HashMap::new();
    for other in 0..3 {
        if other != idx {
            let id = format!("node{}", other + 1);
            peers.insert(id.clone(), format!("127.0.0.1:{}", PEER_PORTS[other]));
            peer_routers.insert(id, format!("127.0.0.1:{}", CLIENT_PORTS[other]));
        }
    }

    let config = Config {
        node_id: node_id.clone(),
        bind_address: "127.0.0.1".to_string(),
        client_port: CLIENT_PORTS[idx],
        peer_port: PEER_PORTS[idx],
        peers: peers.clone(),
        peer_routers,
        submit_timeout: 3.0,
        jwt_secret: JWT_SECRET.to_string(),
        ..Config::default()
    };

    let auth = Arc::new(AuthService::new(JWT_SECRET, 24));
    let state_machine = Arc::new(StateMachine::new());
    let transport = Arc::new(GrpcTransport::new(peers.clone()));
    let node = RaftNode::new(
        node_id,
        peers.keys().cloned().collect(),
        transport,
        Arc::clone(&state_machine),
        fast_timing(),
    );
    node.start();

    let peer_addr = format!("127.0.0.1:{}", PEER_PORTS[idx]).parse().unwrap();
    let raft_service = RaftGrpcService::new(Arc::clone(&node)).into_server();
    tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(raft_service)
            .serve(peer_addr)
            .await;
    });

    let client_addr = format!("127.0.0.1:{}", CLIENT_PORTS[idx]).parse().unwrap();
    let router = RequestRouter::new(&config, Arc::clone(&node), state_machine, auth, None);
    tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(router.into_server())
            .serve(client_addr)
            .await;
    });

    node
}

#[tokio::test(flavor = "multi_thread")]
async fn booking_flow_over_grpc() {
    let mut nodes = Vec::new();
    for idx in 0..3 {
        nodes.push(spawn_replica(idx).await);
    }

    // Wait for the cluster to settle on a leader before driving traffic.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let mut leaders = 0;
        for node in &nodes {
            if node.is_leader().await {
                leaders += 1;
            }
        }
        if leaders == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "no leader elected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let endpoints = CLIENT_PORTS
        .iter()
        .map(|p| format!("127.0.0.1:{}", p))
        .collect();
    let mut client = BookingClient::new(endpoints);

    // Bad credentials are rejected locally, before consensus.
    let rejected = client.login("user1", "wrong").await;
    assert!(matches!(rejected, Err(TicketError::AuthRejected)));

    client.login("user1", "password1").await.unwrap();

    let movies = client.movies().await.unwrap();
    assert_eq!(movies.len(), 3);
    let matrix = movies.iter().find(|m| m.id == "movie1").unwrap();
    assert_eq!(matrix.title, "The Matrix Reloaded");
    assert_eq!(matrix.available_seats, 100);

    // The write lands on the leader regardless of which endpoint the client
    // happens to hit first; non-leaders forward it.
    let outcome = client.book_ticket("movie1", &[50, 51, 52]).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.booking_id.as_deref(), Some("BK000001"));
    assert_eq!(outcome.details.as_ref().unwrap().price, 45.0);

    // The booking is visible through the read path (possibly after a
    // heartbeat of lag on a follower).
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let bookings = client.my_bookings().await.unwrap();
        if bookings.len() == 1 {
            assert_eq!(bookings[0].booking_id, "BK000001");
            break;
        }
        assert!(Instant::now() < deadline, "booking never became visible");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let payment = client.pay("BK000001", "card").await.unwrap();
    assert_eq!(payment.payment_id.as_deref(), Some("PAY000001"));

    // Double-booking the same seats is a domain rejection, not a retryable
    // consensus failure.
    let clash = client.book_ticket("movie1", &[50]).await;
    match clash {
        Err(TicketError::CommandRejected(message)) => {
            assert!(message.contains("Seat 50 not available"));
        }
        other => panic!("expected CommandRejected, got {:?}", other),
    }

    let refund = client.cancel_booking("BK000001").await.unwrap();
    assert_eq!(refund.refund_amount, Some(45.0));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let seats = client.available_seats("movie1").await.unwrap();
        if seats.len() == 100 {
            break;
        }
        assert!(Instant::now() < deadline, "seats never returned");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    client.logout().await.unwrap();
    let unauthenticated = client.movies().await;
    assert!(matches!(unauthenticated, Err(TicketError::AuthRejected)));

    for node in &nodes {
        node.shutdown();
    }
}
