use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::TicketError;

pub mod pb {
    tonic::include_proto!("assist");
}

use pb::assist_service_client::AssistServiceClient;

/// Thin client for the external natural-language helper.
///
/// Calls are forwarded verbatim with a per-call deadline; nothing here is
/// replicated or retried across nodes.
pub struct AssistClient {
    addr: String,
    timeout: Duration,
}

impl AssistClient {
    pub fn new(addr: impl Into<String>) -> Self {
        AssistClient {
            addr: addr.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub async fn ask(&self, query: &str, context: &str) -> Result<String, TicketError> {
        let request_id = Uuid::new_v4().to_string();
        debug!(request_id = %request_id, "forwarding assist query");

        let call = async {
            let mut client = AssistServiceClient::connect(format!("http://{}", self.addr))
                .await
                .map_err(|e| TicketError::PeerUnavailable(e.to_string()))?;
            let reply = client
                .ask(pb::AskRequest {
                    request_id,
                    query: query.to_string(),
                    context: context.to_string(),
                })
                .await
                .map_err(|e| TicketError::PeerUnavailable(e.to_string()))?;
            Ok::<_, TicketError>(reply.into_inner().answer)
        };

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| TicketError::PeerUnavailable("assist service timed out".to_string()))?
    }
}
