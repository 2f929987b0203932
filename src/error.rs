use thiserror::Error;

/// Surface-level error taxonomy for the booking service.
///
/// Domain rejections from the state machine (`CommandRejected`) are applied
/// outcomes, not consensus failures: every replica records the same rejection.
/// `ReplicationTimeout` and `LostLeadership` leave the command in an unknown
/// state; callers retry with the same request id and the state machine
/// deduplicates the replay.
#[derive(Debug, Clone, Error)]
pub enum TicketError {
    #[error("invalid or expired token")]
    AuthRejected,

    // The client library matches on the "Not the leader" substring to decide
    // whether to fail over to the next endpoint, so keep it in the message.
    #[error("Not the leader{}", hint_suffix(.hint))]
    NotLeader { hint: Option<String> },

    #[error("no leader available, try again later")]
    NoLeaderAvailable,

    #[error("replication timeout")]
    ReplicationTimeout,

    #[error("lost leadership before commit")]
    LostLeadership,

    #[error("{0}")]
    CommandRejected(String),

    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(id) => format!(", try {}", id),
        None => String::new(),
    }
}

impl TicketError {
    /// Whether a retry against a different endpoint can succeed.
    pub fn is_leader_miss(&self) -> bool {
        matches!(
            self,
            TicketError::NotLeader { .. } | TicketError::NoLeaderAvailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_message_carries_failover_signal() {
        let bare = TicketError::NotLeader { hint: None };
        assert!(bare.to_string().contains("Not the leader"));

        let hinted = TicketError::NotLeader {
            hint: Some("node2".to_string()),
        };
        let text = hinted.to_string();
        assert!(text.contains("Not the leader"));
        assert!(text.contains("node2"));
    }

    #[test]
    fn leader_miss_classification() {
        assert!(TicketError::NotLeader { hint: None }.is_leader_miss());
        assert!(TicketError::NoLeaderAvailable.is_leader_miss());
        assert!(!TicketError::CommandRejected("Seat 1 not available".into()).is_leader_miss());
        assert!(!TicketError::AuthRejected.is_leader_miss());
    }
}
