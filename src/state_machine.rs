use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::RwLock;
use tracing::debug;

/// How many applied request ids are remembered for replay deduplication.
const RECENT_REQUEST_WINDOW: usize = 1024;

/// A write command, carried through the log as opaque JSON bytes.
///
/// `requested_at` is stamped by the router before submission so that
/// application stays deterministic: replaying the same log prefix on a fresh
/// state machine reproduces the state byte for byte. `request_id` is the
/// client idempotency key; a retried submission is applied at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    BookTicket {
        movie_id: String,
        seats: Vec<u32>,
        principal: String,
        request_id: String,
        requested_at: String,
    },
    CancelBooking {
        booking_id: String,
        principal: String,
        request_id: String,
        requested_at: String,
    },
    ProcessPayment {
        booking_id: String,
        method: String,
        request_id: String,
        requested_at: String,
    },
}

impl Command {
    pub fn request_id(&self) -> &str {
        match self {
            Command::BookTicket { request_id, .. } => request_id,
            Command::CancelBooking { request_id, .. } => request_id,
            Command::ProcessPayment { request_id, .. } => request_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
}

/// Result of applying one command. Domain rejections are successful applied
/// outcomes: every replica computes the same one for the same log position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub status: OutcomeStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Booking>,
}

impl CommandOutcome {
    fn rejected(message: impl Into<String>) -> Self {
        CommandOutcome {
            status: OutcomeStatus::Error,
            message: message.into(),
            booking_id: None,
            payment_id: None,
            refund_amount: None,
            details: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub title: String,
    pub showtime: String,
    pub price: f64,
    pub total_seats: u32,
    pub available_seats: BTreeSet<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub booking_id: String,
    pub principal: String,
    pub movie_id: String,
    pub movie_title: String,
    pub seats: Vec<u32>,
    pub price: f64,
    pub status: BookingStatus,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: String,
    pub booking_id: String,
    pub amount: f64,
    pub method: String,
    pub timestamp: String,
}

/// Catalog row returned by the `movie_list` query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovieSummary {
    pub id: String,
    pub title: String,
    pub available_seats: usize,
    pub total_seats: u32,
    pub price: f64,
    pub showtime: String,
}

/// Full state view for the status endpoint and determinism checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub movies: BTreeMap<String, Movie>,
    pub bookings: BTreeMap<String, Booking>,
    pub payments: BTreeMap<String, Payment>,
    pub next_booking_serial: u64,
    pub next_payment_serial: u64,
}

#[derive(Debug)]
struct BookingState {
    movies: BTreeMap<String, Movie>,
    bookings: BTreeMap<String, Booking>,
    payments: BTreeMap<String, Payment>,
    next_booking_serial: u64,
    next_payment_serial: u64,
    recent_outcomes: HashMap<String, CommandOutcome>,
    recent_order: VecDeque<String>,
}

/// The deterministic booking state machine behind the consensus log.
///
/// Holds its own lock, independent of the consensus node's, so a slow apply
/// never blocks elections or heartbeats. All mutation goes through `apply`,
/// invoked strictly in commit order by the applier task.
pub struct StateMachine {
    state: RwLock<BookingState>,
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine {
            state: RwLock::new(BookingState {
                movies: initial_catalog(),
                bookings: BTreeMap::new(),
                payments: BTreeMap::new(),
                next_booking_serial: 0,
                next_payment_serial: 0,
                recent_outcomes: HashMap::new(),
                recent_order: VecDeque::new(),
            }),
        }
    }

    /// Apply one committed command and return its outcome.
    ///
    /// Replays of a remembered request id return the recorded outcome
    /// without touching the state again.
    pub fn apply(&self, raw: &[u8]) -> CommandOutcome {
        let command: Command = match serde_json::from_slice(raw) {
            Ok(command) => command,
            Err(e) => return CommandOutcome::rejected(format!("Malformed command: {}", e)),
        };

        let mut state = self.state.write().unwrap();

        if let Some(previous) = state.recent_outcomes.get(command.request_id()) {
            debug!(request_id = command.request_id(), "deduplicated replay");
            return previous.clone();
        }

        let request_id = command.request_id().to_string();
        let outcome = match command {
            Command::BookTicket {
                movie_id,
                seats,
                principal,
                requested_at,
                ..
            } => state.book_ticket(&movie_id, &seats, &principal, &requested_at),
            Command::CancelBooking {
                booking_id,
                principal,
                ..
            } => state.cancel_booking(&booking_id, &principal),
            Command::ProcessPayment {
                booking_id,
                method,
                requested_at,
                ..
            } => state.process_payment(&booking_id, &method, &requested_at),
        };

        state.remember(request_id, outcome.clone());
        outcome
    }

    pub fn movies(&self) -> Vec<MovieSummary> {
        let state = self.state.read().unwrap();
        state
            .movies
            .iter()
            .map(|(id, movie)| MovieSummary {
                id: id.clone(),
                title: movie.title.clone(),
                available_seats: movie.available_seats.len(),
                total_seats: movie.total_seats,
                price: movie.price,
                showtime: movie.showtime.clone(),
            })
            .collect()
    }

    pub fn available_seats(&self, movie_id: &str) -> Option<Vec<u32>> {
        let state = self.state.read().unwrap();
        state
            .movies
            .get(movie_id)
            .map(|movie| movie.available_seats.iter().copied().collect())
    }

    pub fn user_bookings(&self, principal: &str) -> Vec<Booking> {
        let state = self.state.read().unwrap();
        state
            .bookings
            .values()
            .filter(|booking| booking.principal == principal)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let state = self.state.read().unwrap();
        StateSnapshot {
            movies: state.movies.clone(),
            bookings: state.bookings.clone(),
            payments: state.payments.clone(),
            next_booking_serial: state.next_booking_serial,
            next_payment_serial: state.next_payment_serial,
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingState {
    fn book_ticket(
        &mut self,
        movie_id: &str,
        seats: &[u32],
        principal: &str,
        requested_at: &str,
    ) -> CommandOutcome {
        let Some(movie) = self.movies.get_mut(movie_id) else {
            return CommandOutcome::rejected("Movie not found");
        };

        let distinct: BTreeSet<u32> = seats.iter().copied().collect();
        if distinct.len() != seats.len() {
            return CommandOutcome::rejected("Duplicate seat in request");
        }
        for seat in seats {
            if !movie.available_seats.contains(seat) {
                return CommandOutcome::rejected(format!("Seat {} not available", seat));
            }
        }

        for seat in seats {
            movie.available_seats.remove(seat);
        }

        self.next_booking_serial += 1;
        let booking_id = format!("BK{:06}", self.next_booking_serial);
        let booking = Booking {
            booking_id: booking_id.clone(),
            principal: principal.to_string(),
            movie_id: movie_id.to_string(),
            movie_title: self.movies[movie_id].title.clone(),
            seats: seats.to_vec(),
            price: self.movies[movie_id].price * seats.len() as f64,
            status: BookingStatus::Confirmed,
            timestamp: requested_at.to_string(),
        };
        self.bookings.insert(booking_id.clone(), booking.clone());

        CommandOutcome {
            status: OutcomeStatus::Success,
            message: "Booking confirmed".to_string(),
            booking_id: Some(booking_id),
            payment_id: None,
            refund_amount: None,
            details: Some(booking),
        }
    }

    fn cancel_booking(&mut self, booking_id: &str, principal: &str) -> CommandOutcome {
        let Some(booking) = self.bookings.get_mut(booking_id) else {
            return CommandOutcome::rejected("Booking not found");
        };

        if booking.principal != principal {
            return CommandOutcome::rejected("Unauthorized");
        }
        if booking.status == BookingStatus::Cancelled {
            return CommandOutcome::rejected("Already cancelled");
        }

        booking.status = BookingStatus::Cancelled;
        let refund = booking.price;
        let movie_id = booking.movie_id.clone();
        let seats = booking.seats.clone();

        // BTreeSet keeps the returned seats in ascending order.
        if let Some(movie) = self.movies.get_mut(&movie_id) {
            movie.available_seats.extend(seats);
        }

        CommandOutcome {
            status: OutcomeStatus::Success,
            message: "Booking cancelled".to_string(),
            booking_id: Some(booking_id.to_string()),
            payment_id: None,
            refund_amount: Some(refund),
            details: None,
        }
    }

    fn process_payment(
        &mut self,
        booking_id: &str,
        method: &str,
        requested_at: &str,
    ) -> CommandOutcome {
        let Some(booking) = self.bookings.get(booking_id) else {
            return CommandOutcome::rejected("Booking not found");
        };

        self.next_payment_serial += 1;
        let payment_id = format!("PAY{:06}", self.next_payment_serial);
        self.payments.insert(
            payment_id.clone(),
            Payment {
                payment_id: payment_id.clone(),
                booking_id: booking_id.to_string(),
                amount: booking.price,
                method: method.to_string(),
                timestamp: requested_at.to_string(),
            },
        );

        CommandOutcome {
            status: OutcomeStatus::Success,
            message: "Payment processed".to_string(),
            booking_id: Some(booking_id.to_string()),
            payment_id: Some(payment_id),
            refund_amount: None,
            details: None,
        }
    }

    fn remember(&mut self, request_id: String, outcome: CommandOutcome) {
        if self.recent_order.len() >= RECENT_REQUEST_WINDOW {
            if let Some(evicted) = self.recent_order.pop_front() {
                self.recent_outcomes.remove(&evicted);
            }
        }
        self.recent_order.push_back(request_id.clone());
        self.recent_outcomes.insert(request_id, outcome);
    }
}

fn initial_catalog() -> BTreeMap<String, Movie> {
    let mut movies = BTreeMap::new();
    movies.insert(
        "movie1".to_string(),
        Movie {
            title: "The Matrix Reloaded".to_string(),
            showtime: "2025-11-20 19:00".to_string(),
            price: 15.0,
            total_seats: 100,
            available_seats: (1..=100).collect(),
        },
    );
    movies.insert(
        "movie2".to_string(),
        Movie {
            title: "Inception Dreams".to_string(),
            showtime: "2025-11-20 21:00".to_string(),
            price: 12.0,
            total_seats: 80,
            available_seats: (1..=80).collect(),
        },
    );
    movies.insert(
        "movie3".to_string(),
        Movie {
            title: "Interstellar Journey".to_string(),
            showtime: "2025-11-21 18:00".to_string(),
            price: 18.0,
            total_seats: 120,
            available_seats: (1..=120).collect(),
        },
    );
    movies
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(movie: &str, seats: &[u32], principal: &str, request_id: &str) -> Vec<u8> {
        serde_json::to_vec(&Command::BookTicket {
            movie_id: movie.to_string(),
            seats: seats.to_vec(),
            principal: principal.to_string(),
            request_id: request_id.to_string(),
            requested_at: "2025-11-19T12:00:00Z".to_string(),
        })
        .unwrap()
    }

    fn cancel(booking_id: &str, principal: &str, request_id: &str) -> Vec<u8> {
        serde_json::to_vec(&Command::CancelBooking {
            booking_id: booking_id.to_string(),
            principal: principal.to_string(),
            request_id: request_id.to_string(),
            requested_at: "2025-11-19T12:01:00Z".to_string(),
        })
        .unwrap()
    }

    fn pay(booking_id: &str, method: &str, request_id: &str) -> Vec<u8> {
        serde_json::to_vec(&Command::ProcessPayment {
            booking_id: booking_id.to_string(),
            method: method.to_string(),
            request_id: request_id.to_string(),
            requested_at: "2025-11-19T12:02:00Z".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn happy_booking() {
        let sm = StateMachine::new();
        let outcome = sm.apply(&book("movie1", &[50, 51, 52], "user1", "r1"));

        assert!(outcome.is_success());
        assert_eq!(outcome.booking_id.as_deref(), Some("BK000001"));
        let details = outcome.details.unwrap();
        assert_eq!(details.price, 45.0);
        assert_eq!(details.status, BookingStatus::Confirmed);
        assert_eq!(details.movie_title, "The Matrix Reloaded");

        let seats = sm.available_seats("movie1").unwrap();
        assert_eq!(seats.len(), 97);
        assert!(!seats.contains(&50));
        assert!(!seats.contains(&51));
        assert!(!seats.contains(&52));
    }

    #[test]
    fn rejects_unknown_movie_and_taken_seat() {
        let sm = StateMachine::new();
        let missing = sm.apply(&book("movie9", &[1], "user1", "r1"));
        assert_eq!(missing.status, OutcomeStatus::Error);
        assert_eq!(missing.message, "Movie not found");

        assert!(sm.apply(&book("movie1", &[1, 2, 3], "user1", "r2")).is_success());
        let clash = sm.apply(&book("movie1", &[1, 2, 3], "user2", "r3"));
        assert_eq!(clash.status, OutcomeStatus::Error);
        assert_eq!(clash.message, "Seat 1 not available");

        // The losing booking must not consume any seats.
        assert_eq!(sm.available_seats("movie1").unwrap().len(), 97);
    }

    #[test]
    fn duplicate_seats_rejected() {
        let sm = StateMachine::new();
        let outcome = sm.apply(&book("movie1", &[4, 4], "user1", "r1"));
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert_eq!(outcome.message, "Duplicate seat in request");
        assert_eq!(sm.available_seats("movie1").unwrap().len(), 100);
    }

    #[test]
    fn partial_overlap_rejected_atomically() {
        let sm = StateMachine::new();
        assert!(sm.apply(&book("movie2", &[10], "user1", "r1")).is_success());
        // Seat 11 is free but 10 is taken; nothing may be booked.
        let outcome = sm.apply(&book("movie2", &[10, 11], "user2", "r2"));
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(sm.available_seats("movie2").unwrap().contains(&11));
    }

    #[test]
    fn cancel_refunds_and_restores_seats_in_order() {
        let sm = StateMachine::new();
        let before = sm.available_seats("movie1").unwrap();
        sm.apply(&book("movie1", &[50, 51, 52], "user1", "r1"));

        let outcome = sm.apply(&cancel("BK000001", "user1", "r2"));
        assert!(outcome.is_success());
        assert_eq!(outcome.refund_amount, Some(45.0));

        let after = sm.available_seats("movie1").unwrap();
        assert_eq!(after, before);
        // Ascending order restored.
        assert!(after.windows(2).all(|w| w[0] < w[1]));

        let bookings = sm.user_bookings("user1");
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].status, BookingStatus::Cancelled);
    }

    #[test]
    fn cancel_requires_owner_and_confirmed_status() {
        let sm = StateMachine::new();
        sm.apply(&book("movie1", &[5], "user1", "r1"));

        let stranger = sm.apply(&cancel("BK000001", "user2", "r2"));
        assert_eq!(stranger.message, "Unauthorized");

        assert!(sm.apply(&cancel("BK000001", "user1", "r3")).is_success());
        let twice = sm.apply(&cancel("BK000001", "user1", "r4"));
        assert_eq!(twice.message, "Already cancelled");

        let ghost = sm.apply(&cancel("BK999999", "user1", "r5"));
        assert_eq!(ghost.message, "Booking not found");
    }

    #[test]
    fn payment_ids_are_monotonic() {
        let sm = StateMachine::new();
        sm.apply(&book("movie1", &[1], "user1", "r1"));
        sm.apply(&book("movie1", &[2], "user1", "r2"));

        let first = sm.apply(&pay("BK000001", "card", "r3"));
        let second = sm.apply(&pay("BK000002", "cash", "r4"));
        assert_eq!(first.payment_id.as_deref(), Some("PAY000001"));
        assert_eq!(second.payment_id.as_deref(), Some("PAY000002"));

        let missing = sm.apply(&pay("BK999999", "card", "r5"));
        assert_eq!(missing.message, "Booking not found");
    }

    #[test]
    fn replayed_request_id_applies_once() {
        let sm = StateMachine::new();
        let command = book("movie1", &[7, 8], "user1", "retry-1");

        let first = sm.apply(&command);
        let replay = sm.apply(&command);

        assert_eq!(first, replay);
        assert_eq!(sm.user_bookings("user1").len(), 1);
        assert_eq!(sm.available_seats("movie1").unwrap().len(), 98);
    }

    #[test]
    fn seat_conservation_across_workload() {
        let sm = StateMachine::new();
        sm.apply(&book("movie1", &[1, 2, 3], "user1", "r1"));
        sm.apply(&book("movie1", &[10, 11], "user2", "r2"));
        sm.apply(&cancel("BK000001", "user1", "r3"));
        sm.apply(&book("movie1", &[2, 20], "user2", "r4"));

        let snapshot = sm.snapshot();
        let movie = &snapshot.movies["movie1"];
        let held: usize = snapshot
            .bookings
            .values()
            .filter(|b| b.movie_id == "movie1" && b.status == BookingStatus::Confirmed)
            .map(|b| b.seats.len())
            .sum();
        assert_eq!(movie.available_seats.len() + held, movie.total_seats as usize);

        // No seat in two confirmed bookings.
        let mut seen = BTreeSet::new();
        for booking in snapshot
            .bookings
            .values()
            .filter(|b| b.movie_id == "movie1" && b.status == BookingStatus::Confirmed)
        {
            for seat in &booking.seats {
                assert!(seen.insert(*seat), "seat {} double booked", seat);
            }
        }
    }

    #[test]
    fn identical_log_prefix_yields_identical_state() {
        let commands = vec![
            book("movie1", &[50, 51, 52], "user1", "r1"),
            book("movie2", &[1], "user2", "r2"),
            cancel("BK000001", "user1", "r3"),
            pay("BK000002", "card", "r4"),
            book("movie1", &[50], "user2", "r5"),
        ];

        let a = StateMachine::new();
        let b = StateMachine::new();
        for command in &commands {
            a.apply(command);
        }
        for command in &commands {
            b.apply(command);
        }

        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(
            serde_json::to_vec(&a.snapshot()).unwrap(),
            serde_json::to_vec(&b.snapshot()).unwrap()
        );
    }

    #[test]
    fn malformed_command_is_a_recorded_rejection() {
        let sm = StateMachine::new();
        let outcome = sm.apply(b"{not json");
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(outcome.message.starts_with("Malformed command"));
    }
}
