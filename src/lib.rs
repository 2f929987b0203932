pub mod assist;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod raft;
pub mod router;
pub mod state_machine;
pub mod status;

pub use client::BookingClient;
pub use config::Config;
pub use error::TicketError;
