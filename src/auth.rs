use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::error::TicketError;

/// Credential verification and session tokens.
///
/// Tokens are stateless HS256 JWTs, so any replica can validate a token
/// minted by any other replica without shared session state. Logout is a
/// client-side discard; the token simply ages out.
pub struct AuthService {
    users: HashMap<String, String>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_hours: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

impl AuthService {
    pub fn new(secret: &str, ttl_hours: u64) -> Self {
        let users = [
            ("user1", "password1"),
            ("user2", "password2"),
            ("admin", "admin123"),
        ]
        .into_iter()
        .map(|(u, p)| (u.to_string(), p.to_string()))
        .collect();

        AuthService {
            users,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl_hours,
        }
    }

    /// Verify credentials and mint a session token.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<String, TicketError> {
        match self.users.get(username) {
            Some(stored) if stored == password => {
                let claims = Claims {
                    sub: username.to_string(),
                    exp: (Utc::now() + chrono::Duration::hours(self.ttl_hours as i64)).timestamp()
                        as usize,
                };
                encode(&Header::default(), &claims, &self.encoding_key)
                    .map_err(|e| TicketError::Internal(e.to_string()))
            }
            _ => {
                debug!(username, "rejected login");
                Err(TicketError::AuthRejected)
            }
        }
    }

    /// Validate a token and return the principal it was minted for.
    pub fn validate(&self, token: &str) -> Result<String, TicketError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims.sub)
            .map_err(|_| TicketError::AuthRejected)
    }
}
