use bytes::Bytes;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assist::AssistClient;
use crate::auth::AuthService;
use crate::config::Config;
use crate::error::TicketError;
use crate::raft::RaftNode;
use crate::state_machine::{Command, CommandOutcome, StateMachine};

pub mod pb {
    tonic::include_proto!("booking");
}

use pb::ticket_booking_client::TicketBookingClient;
use pb::ticket_booking_server::{TicketBooking, TicketBookingServer};

/// The client-facing surface of a replica.
///
/// Reads are served from the local state machine (prefix-consistent, allowed
/// during elections). Writes go through the local consensus node when it is
/// leader, otherwise they fan out to the peer routers; a relayed write that
/// still misses the leader is answered with `NotLeader` rather than relayed
/// again, so forwarding never cycles.
pub struct RequestRouter {
    node_id: String,
    node: Arc<RaftNode>,
    state_machine: Arc<StateMachine>,
    auth: Arc<AuthService>,
    peer_routers: HashMap<String, String>,
    assist: Option<AssistClient>,
    forward_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct BookPayload {
    movie_id: String,
    #[serde(default)]
    seats: Vec<u32>,
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CancelPayload {
    booking_id: String,
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentPayload {
    booking_id: String,
    #[serde(default = "default_payment_method")]
    payment_method: String,
    request_id: Option<String>,
}

fn default_payment_method() -> String {
    "card".to_string()
}

#[derive(Debug, Deserialize)]
struct SeatQuery {
    movie_id: String,
}

impl RequestRouter {
    pub fn new(
        config: &Config,
        node: Arc<RaftNode>,
        state_machine: Arc<StateMachine>,
        auth: Arc<AuthService>,
        assist: Option<AssistClient>,
    ) -> Self {
        RequestRouter {
            node_id: config.node_id.clone(),
            node,
            state_machine,
            auth,
            peer_routers: config.peer_routers.clone(),
            // Forwarded writes ride out the leader's full submit window.
            forward_timeout: config.submit_deadline() + Duration::from_secs(2),
            assist,
        }
    }

    pub fn into_server(self) -> TicketBookingServer<Self> {
        TicketBookingServer::new(self)
    }

    /// Parse a write payload into a state machine command.
    ///
    /// The originating router stamps the idempotency key and the timestamp;
    /// the returned JSON string carries the key so every forwarded attempt
    /// submits the same logical command.
    fn build_command(
        kind: &str,
        data: &str,
        principal: &str,
    ) -> Result<(Command, String), TicketError> {
        let requested_at = Utc::now().to_rfc3339();
        let command = match kind {
            "book_ticket" => {
                let payload: BookPayload = serde_json::from_str(data)
                    .map_err(|e| TicketError::CommandRejected(format!("Invalid payload: {}", e)))?;
                Command::BookTicket {
                    movie_id: payload.movie_id,
                    seats: payload.seats,
                    principal: principal.to_string(),
                    request_id: payload
                        .request_id
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    requested_at,
                }
            }
            "cancel_booking" => {
                let payload: CancelPayload = serde_json::from_str(data)
                    .map_err(|e| TicketError::CommandRejected(format!("Invalid payload: {}", e)))?;
                Command::CancelBooking {
                    booking_id: payload.booking_id,
                    principal: principal.to_string(),
                    request_id: payload
                        .request_id
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    requested_at,
                }
            }
            "payment" => {
                let payload: PaymentPayload = serde_json::from_str(data)
                    .map_err(|e| TicketError::CommandRejected(format!("Invalid payload: {}", e)))?;
                Command::ProcessPayment {
                    booking_id: payload.booking_id,
                    method: payload.payment_method,
                    request_id: payload
                        .request_id
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    requested_at,
                }
            }
            other => {
                return Err(TicketError::CommandRejected(format!(
                    "Unknown operation type: {}",
                    other
                )))
            }
        };

        // Re-encode the payload with the request id pinned, for forwarding.
        let mut value: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| TicketError::CommandRejected(format!("Invalid payload: {}", e)))?;
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "request_id".to_string(),
                serde_json::Value::String(command.request_id().to_string()),
            );
        }
        let data_with_id = value.to_string();

        Ok((command, data_with_id))
    }

    async fn dispatch_write(
        &self,
        request: &pb::PostRequest,
        principal: &str,
    ) -> Result<CommandOutcome, TicketError> {
        let (command, data_with_id) =
            Self::build_command(&request.r#type, &request.data, principal)?;
        let encoded = serde_json::to_vec(&command)
            .map_err(|e| TicketError::Internal(e.to_string()))?;

        match self.node.submit(Bytes::from(encoded)).await {
            Ok(outcome) => Ok(outcome),
            Err(TicketError::NotLeader { hint }) if !request.forwarded => {
                debug!(node = %self.node_id, ?hint, "not leader, forwarding write to peers");
                self.forward_write(request, &data_with_id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Relay a write to the peer routers in parallel; the first reply that is
    /// not a leader miss wins.
    async fn forward_write(
        &self,
        request: &pb::PostRequest,
        data: &str,
    ) -> Result<CommandOutcome, TicketError> {
        if self.peer_routers.is_empty() {
            return Err(TicketError::NoLeaderAvailable);
        }

        let relayed = pb::PostRequest {
            token: request.token.clone(),
            r#type: request.r#type.clone(),
            data: data.to_string(),
            forwarded: true,
        };

        let mut calls = FuturesUnordered::new();
        for (peer_id, addr) in &self.peer_routers {
            let peer_id = peer_id.clone();
            let addr = addr.clone();
            let relayed = relayed.clone();
            let deadline = self.forward_timeout;
            calls.push(async move {
                let call = async {
                    let mut client = TicketBookingClient::connect(format!("http://{}", addr))
                        .await
                        .map_err(|e| TicketError::PeerUnavailable(e.to_string()))?;
                    let response = client
                        .post(relayed)
                        .await
                        .map_err(|e| TicketError::PeerUnavailable(e.to_string()))?;
                    Ok::<_, TicketError>(response.into_inner())
                };
                match tokio::time::timeout(deadline, call).await {
                    Ok(Ok(response)) => Some((peer_id, response)),
                    Ok(Err(e)) => {
                        debug!(peer = %peer_id, error = %e, "forward attempt failed");
                        None
                    }
                    Err(_) => {
                        debug!(peer = %peer_id, "forward attempt timed out");
                        None
                    }
                }
            });
        }

        while let Some(result) = calls.next().await {
            let Some((peer_id, response)) = result else {
                continue;
            };
            if response.status == "success" {
                info!(node = %self.node_id, peer = %peer_id, "write forwarded to leader");
                let outcome = serde_json::from_str(&response.message)
                    .map_err(|e| TicketError::Internal(e.to_string()))?;
                return Ok(outcome);
            }
            if !response.message.contains("Not the leader") {
                // A definitive answer from the leader; rejection included.
                return Err(TicketError::CommandRejected(response.message));
            }
        }

        warn!(node = %self.node_id, "no peer accepted the write");
        Err(TicketError::NoLeaderAvailable)
    }

    fn handle_get(&self, kind: &str, params: &str, principal: &str) -> Result<Vec<pb::DataItem>, TicketError> {
        match kind {
            "movie_list" => Ok(self
                .state_machine
                .movies()
                .into_iter()
                .map(|movie| pb::DataItem {
                    id: movie.id.clone(),
                    data: serde_json::to_string(&movie).unwrap_or_default(),
                })
                .collect()),
            "available_seats" => {
                let query: SeatQuery = serde_json::from_str(params).map_err(|e| {
                    TicketError::CommandRejected(format!("Invalid params: {}", e))
                })?;
                let seats = self
                    .state_machine
                    .available_seats(&query.movie_id)
                    .unwrap_or_default();
                Ok(vec![pb::DataItem {
                    id: query.movie_id,
                    data: serde_json::json!({ "available_seats": seats }).to_string(),
                }])
            }
            "my_bookings" => Ok(self
                .state_machine
                .user_bookings(principal)
                .into_iter()
                .map(|booking| pb::DataItem {
                    id: booking.booking_id.clone(),
                    data: serde_json::to_string(&booking).unwrap_or_default(),
                })
                .collect()),
            other => Err(TicketError::CommandRejected(format!(
                "Unknown query type: {}",
                other
            ))),
        }
    }

    fn build_assist_context(&self, principal: &str) -> String {
        format!(
            "User: {}\nAvailable Movies: {}\nUser's Bookings: {}",
            principal,
            self.state_machine.movies().len(),
            self.state_machine.user_bookings(principal).len()
        )
    }
}

#[tonic::async_trait]
impl TicketBooking for RequestRouter {
    async fn login(
        &self,
        request: Request<pb::LoginRequest>,
    ) -> Result<Response<pb::LoginResponse>, Status> {
        let req = request.into_inner();
        info!(node = %self.node_id, username = %req.username, "login attempt");

        let response = match self.auth.authenticate(&req.username, &req.password) {
            Ok(token) => pb::LoginResponse {
                status: "success".to_string(),
                token,
                message: "Login successful".to_string(),
            },
            Err(_) => pb::LoginResponse {
                status: "error".to_string(),
                token: String::new(),
                message: "Invalid credentials".to_string(),
            },
        };
        Ok(Response::new(response))
    }

    async fn logout(
        &self,
        _request: Request<pb::LogoutRequest>,
    ) -> Result<Response<pb::StatusResponse>, Status> {
        // Tokens are stateless; logout is a client-side discard.
        Ok(Response::new(pb::StatusResponse {
            status: "success".to_string(),
            message: "Logged out successfully".to_string(),
        }))
    }

    async fn get(
        &self,
        request: Request<pb::GetRequest>,
    ) -> Result<Response<pb::GetResponse>, Status> {
        let req = request.into_inner();
        let principal = match self.auth.validate(&req.token) {
            Ok(principal) => principal,
            Err(_) => {
                return Ok(Response::new(pb::GetResponse {
                    status: "error".to_string(),
                    items: vec![],
                    message: "Invalid or expired token".to_string(),
                }))
            }
        };
        debug!(node = %self.node_id, kind = %req.r#type, principal = %principal, "read request");

        let response = match self.handle_get(&req.r#type, &req.params, &principal) {
            Ok(items) => pb::GetResponse {
                status: "success".to_string(),
                items,
                message: "Query successful".to_string(),
            },
            Err(e) => pb::GetResponse {
                status: "error".to_string(),
                items: vec![],
                message: e.to_string(),
            },
        };
        Ok(Response::new(response))
    }

    async fn post(
        &self,
        request: Request<pb::PostRequest>,
    ) -> Result<Response<pb::StatusResponse>, Status> {
        let req = request.into_inner();
        let principal = match self.auth.validate(&req.token) {
            Ok(principal) => principal,
            Err(_) => {
                return Ok(Response::new(pb::StatusResponse {
                    status: "error".to_string(),
                    message: "Invalid or expired token".to_string(),
                }))
            }
        };
        info!(
            node = %self.node_id,
            kind = %req.r#type,
            principal = %principal,
            forwarded = req.forwarded,
            "write request"
        );

        let response = match self.dispatch_write(&req, &principal).await {
            Ok(outcome) if outcome.is_success() => pb::StatusResponse {
                status: "success".to_string(),
                message: serde_json::to_string(&outcome)
                    .unwrap_or_else(|_| outcome.message.clone()),
            },
            Ok(outcome) => pb::StatusResponse {
                status: "error".to_string(),
                message: outcome.message,
            },
            Err(e) => pb::StatusResponse {
                status: "error".to_string(),
                message: e.to_string(),
            },
        };
        Ok(Response::new(response))
    }

    async fn assist(
        &self,
        request: Request<pb::AssistRequest>,
    ) -> Result<Response<pb::AssistResponse>, Status> {
        let req = request.into_inner();
        let principal = match self.auth.validate(&req.token) {
            Ok(principal) => principal,
            Err(_) => {
                return Ok(Response::new(pb::AssistResponse {
                    status: "error".to_string(),
                    answer: "Please login first".to_string(),
                }))
            }
        };

        let Some(assist) = &self.assist else {
            return Ok(Response::new(pb::AssistResponse {
                status: "error".to_string(),
                answer: "Assist service not configured".to_string(),
            }));
        };

        let context = format!(
            "{}\n\nCurrent System State:\n{}",
            req.context,
            self.build_assist_context(&principal)
        );

        let response = match assist.ask(&req.query, &context).await {
            Ok(answer) => pb::AssistResponse {
                status: "success".to_string(),
                answer,
            },
            Err(e) => pb::AssistResponse {
                status: "error".to_string(),
                answer: format!("Assist service unavailable: {}", e),
            },
        };
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_generates_request_id() {
        let (command, data) = RequestRouter::build_command(
            "book_ticket",
            r#"{"movie_id":"movie1","seats":[1,2]}"#,
            "user1",
        )
        .unwrap();

        let Command::BookTicket {
            movie_id,
            seats,
            principal,
            request_id,
            ..
        } = &command
        else {
            panic!("wrong command variant");
        };
        assert_eq!(movie_id, "movie1");
        assert_eq!(seats, &[1, 2]);
        assert_eq!(principal, "user1");
        assert!(!request_id.is_empty());

        // The re-encoded payload pins the generated id for forwarding.
        let value: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(value["request_id"].as_str().unwrap(), request_id);
    }

    #[test]
    fn build_command_keeps_client_request_id() {
        let (command, data) = RequestRouter::build_command(
            "cancel_booking",
            r#"{"booking_id":"BK000001","request_id":"client-key-1"}"#,
            "user1",
        )
        .unwrap();
        assert_eq!(command.request_id(), "client-key-1");
        let value: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(value["request_id"].as_str().unwrap(), "client-key-1");
    }

    #[test]
    fn build_command_defaults_payment_method() {
        let (command, _) = RequestRouter::build_command(
            "payment",
            r#"{"booking_id":"BK000001"}"#,
            "user2",
        )
        .unwrap();
        let Command::ProcessPayment { method, .. } = command else {
            panic!("wrong command variant");
        };
        assert_eq!(method, "card");
    }

    #[test]
    fn build_command_rejects_unknown_type() {
        let err = RequestRouter::build_command("teleport", "{}", "user1").unwrap_err();
        assert!(matches!(err, TicketError::CommandRejected(_)));
    }

    #[test]
    fn build_command_rejects_malformed_payload() {
        let err = RequestRouter::build_command("book_ticket", "{nope", "user1").unwrap_err();
        assert!(matches!(err, TicketError::CommandRejected(_)));
    }
}
