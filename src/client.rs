use serde_json::json;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TicketError;
use crate::router::pb;
use crate::state_machine::{Booking, CommandOutcome, MovieSummary};

use pb::ticket_booking_client::TicketBookingClient;

/// How many consecutive failures invalidate the cached leader.
const LEADER_FAILURE_THRESHOLD: u32 = 2;

/// Leader cache with failure counting.
///
/// Writes try the cached leader first while its failure count stays under the
/// threshold, then the remaining endpoints in stable order.
#[derive(Debug, Default, Clone)]
struct LeaderCache {
    cached: Option<usize>,
    failures: u32,
}

impl LeaderCache {
    fn order(&self, endpoints: usize) -> Vec<usize> {
        let mut order = Vec::with_capacity(endpoints);
        if let Some(leader) = self.cached {
            if self.failures < LEADER_FAILURE_THRESHOLD && leader < endpoints {
                order.push(leader);
            }
        }
        for idx in 0..endpoints {
            if !order.contains(&idx) {
                order.push(idx);
            }
        }
        order
    }

    fn note_success(&mut self, idx: usize) {
        self.cached = Some(idx);
        self.failures = 0;
    }

    fn note_failure(&mut self, idx: usize) {
        if self.cached == Some(idx) {
            self.failures += 1;
            if self.failures >= LEADER_FAILURE_THRESHOLD {
                self.cached = None;
                self.failures = 0;
            }
        }
    }
}

/// Multi-endpoint client presenting the cluster as one logical service.
///
/// Reads may land on any replica (prefix-consistent); writes chase the leader
/// with cached-leader-first ordering and progressive backoff between rounds.
pub struct BookingClient {
    endpoints: Vec<String>,
    cache: LeaderCache,
    token: Option<String>,
    username: Option<String>,
    max_rounds: u32,
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl BookingClient {
    pub fn new(endpoints: Vec<String>) -> Self {
        BookingClient {
            endpoints,
            cache: LeaderCache::default(),
            token: None,
            username: None,
            max_rounds: 5,
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(15),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    async fn connect(&self, idx: usize) -> Result<TicketBookingClient<Channel>, TicketError> {
        let addr = &self.endpoints[idx];
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| TicketError::Internal(e.to_string()))?
            .connect_timeout(self.connect_timeout)
            .timeout(self.call_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| TicketError::PeerUnavailable(format!("{}: {}", addr, e)))?;
        Ok(TicketBookingClient::new(channel))
    }

    fn token(&self) -> Result<String, TicketError> {
        self.token.clone().ok_or(TicketError::AuthRejected)
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), TicketError> {
        let request = pb::LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        // Any replica can authenticate; take the first reachable one.
        let mut last_err = TicketError::NoLeaderAvailable;
        for idx in 0..self.endpoints.len() {
            match self.connect(idx).await {
                Ok(mut client) => {
                    let response = client
                        .login(request.clone())
                        .await
                        .map_err(|e| TicketError::PeerUnavailable(e.to_string()));
                    match response {
                        Ok(response) => {
                            let response = response.into_inner();
                            if response.status == "success" {
                                self.token = Some(response.token);
                                self.username = Some(username.to_string());
                                return Ok(());
                            }
                            return Err(TicketError::AuthRejected);
                        }
                        Err(e) => last_err = e,
                    }
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    pub async fn logout(&mut self) -> Result<(), TicketError> {
        let token = self.token()?;
        for idx in 0..self.endpoints.len() {
            if let Ok(mut client) = self.connect(idx).await {
                let _ = client
                    .logout(pb::LogoutRequest {
                        token: token.clone(),
                    })
                    .await;
                break;
            }
        }
        self.token = None;
        self.username = None;
        Ok(())
    }

    /// Reads can go to any endpoint; retry across them on failure.
    async fn get(&self, kind: &str, params: String) -> Result<Vec<pb::DataItem>, TicketError> {
        let token = self.token()?;
        let mut last_err = TicketError::NoLeaderAvailable;
        for idx in 0..self.endpoints.len() {
            let mut client = match self.connect(idx).await {
                Ok(client) => client,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            let request = pb::GetRequest {
                token: token.clone(),
                r#type: kind.to_string(),
                params: params.clone(),
            };
            match client.get(request).await {
                Ok(response) => {
                    let response = response.into_inner();
                    if response.status == "success" {
                        return Ok(response.items);
                    }
                    return Err(classify_error(&response.message));
                }
                Err(e) => {
                    debug!(endpoint = %self.endpoints[idx], error = %e, "read failed");
                    last_err = TicketError::PeerUnavailable(e.to_string());
                }
            }
        }
        Err(last_err)
    }

    /// Writes use cached-leader-first ordering with progressive backoff.
    async fn post(&mut self, kind: &str, data: String) -> Result<CommandOutcome, TicketError> {
        let token = self.token()?;

        for round in 1..=self.max_rounds {
            for idx in self.cache.order(self.endpoints.len()) {
                let mut client = match self.connect(idx).await {
                    Ok(client) => client,
                    Err(e) => {
                        debug!(endpoint = %self.endpoints[idx], error = %e, "connect failed");
                        self.cache.note_failure(idx);
                        continue;
                    }
                };
                let request = pb::PostRequest {
                    token: token.clone(),
                    r#type: kind.to_string(),
                    data: data.clone(),
                    forwarded: false,
                };
                let response = match client.post(request).await {
                    Ok(response) => response.into_inner(),
                    Err(e) => {
                        debug!(endpoint = %self.endpoints[idx], error = %e, "write failed");
                        self.cache.note_failure(idx);
                        continue;
                    }
                };

                if response.status == "success" {
                    self.cache.note_success(idx);
                    return serde_json::from_str(&response.message)
                        .map_err(|e| TicketError::Internal(e.to_string()));
                }
                if is_leader_miss(&response.message) {
                    self.cache.note_failure(idx);
                    continue;
                }
                // A definitive answer: this endpoint reached the leader.
                self.cache.note_success(idx);
                return Err(classify_error(&response.message));
            }

            if round < self.max_rounds {
                let backoff = Duration::from_secs_f64((0.5 * round as f64).min(2.0));
                warn!(round, ?backoff, "no endpoint accepted the write, backing off");
                tokio::time::sleep(backoff).await;
            }
        }

        Err(TicketError::NoLeaderAvailable)
    }

    pub async fn movies(&self) -> Result<Vec<MovieSummary>, TicketError> {
        let items = self.get("movie_list", String::new()).await?;
        items
            .into_iter()
            .map(|item| {
                serde_json::from_str(&item.data).map_err(|e| TicketError::Internal(e.to_string()))
            })
            .collect()
    }

    pub async fn available_seats(&self, movie_id: &str) -> Result<Vec<u32>, TicketError> {
        let params = json!({ "movie_id": movie_id }).to_string();
        let items = self.get("available_seats", params).await?;
        let Some(item) = items.first() else {
            return Ok(vec![]);
        };
        let value: serde_json::Value =
            serde_json::from_str(&item.data).map_err(|e| TicketError::Internal(e.to_string()))?;
        Ok(value["available_seats"]
            .as_array()
            .map(|seats| {
                seats
                    .iter()
                    .filter_map(|s| s.as_u64().map(|s| s as u32))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn my_bookings(&self) -> Result<Vec<Booking>, TicketError> {
        let items = self.get("my_bookings", String::new()).await?;
        items
            .into_iter()
            .map(|item| {
                serde_json::from_str(&item.data).map_err(|e| TicketError::Internal(e.to_string()))
            })
            .collect()
    }

    /// Book seats, generating a fresh idempotency key for the attempt.
    pub async fn book_ticket(
        &mut self,
        movie_id: &str,
        seats: &[u32],
    ) -> Result<CommandOutcome, TicketError> {
        self.book_ticket_with_request_id(movie_id, seats, &Uuid::new_v4().to_string())
            .await
    }

    /// Book seats under a caller-chosen idempotency key, so a retry after an
    /// ambiguous failure is applied at most once.
    pub async fn book_ticket_with_request_id(
        &mut self,
        movie_id: &str,
        seats: &[u32],
        request_id: &str,
    ) -> Result<CommandOutcome, TicketError> {
        let data = json!({
            "movie_id": movie_id,
            "seats": seats,
            "request_id": request_id,
        })
        .to_string();
        self.post("book_ticket", data).await
    }

    pub async fn cancel_booking(&mut self, booking_id: &str) -> Result<CommandOutcome, TicketError> {
        let data = json!({
            "booking_id": booking_id,
            "request_id": Uuid::new_v4().to_string(),
        })
        .to_string();
        self.post("cancel_booking", data).await
    }

    pub async fn pay(
        &mut self,
        booking_id: &str,
        method: &str,
    ) -> Result<CommandOutcome, TicketError> {
        let data = json!({
            "booking_id": booking_id,
            "payment_method": method,
            "request_id": Uuid::new_v4().to_string(),
        })
        .to_string();
        self.post("payment", data).await
    }

    pub async fn assist(&self, query: &str, context: &str) -> Result<String, TicketError> {
        let token = self.token()?;
        let mut last_err = TicketError::NoLeaderAvailable;
        for idx in 0..self.endpoints.len() {
            let mut client = match self.connect(idx).await {
                Ok(client) => client,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            let request = pb::AssistRequest {
                token: token.clone(),
                query: query.to_string(),
                context: context.to_string(),
            };
            match client.assist(request).await {
                Ok(response) => {
                    let response = response.into_inner();
                    if response.status == "success" {
                        return Ok(response.answer);
                    }
                    return Err(TicketError::Internal(response.answer));
                }
                Err(e) => last_err = TicketError::PeerUnavailable(e.to_string()),
            }
        }
        Err(last_err)
    }
}

fn is_leader_miss(message: &str) -> bool {
    message.contains("Not the leader") || message.contains("no leader available")
}

fn classify_error(message: &str) -> TicketError {
    if message.contains("Invalid or expired token") {
        TicketError::AuthRejected
    } else if is_leader_miss(message) {
        TicketError::NoLeaderAvailable
    } else {
        TicketError::CommandRejected(message.to_string())
    }
}
