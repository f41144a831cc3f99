use async_trait::async_trait;
use parking_lot::Mutex;

use crate::realtime::{RealtimeClient, RealtimeError, RealtimeSession};

/// Records every requested session and answers with a canned secret, or with
/// the failure queued through [`FakeRealtimeClient::fail_next`].
#[derive(Default)]
pub struct FakeRealtimeClient {
    pub sessions: Mutex<Vec<RealtimeSession>>,
    next_error: Mutex<Option<RealtimeError>>,
}

impl FakeRealtimeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: RealtimeError) {
        *self.next_error.lock() = Some(error);
    }

    pub fn last_session(&self) -> Option<RealtimeSession> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl RealtimeClient for FakeRealtimeClient {
    async fn create_client_secret(
        &self,
        session: &RealtimeSession,
    ) -> Result<serde_json::Value, RealtimeError> {
        if let Some(error) = self.next_error.lock().take() {
            return Err(error);
        }

        let mut sessions = self.sessions.lock();
        sessions.push(session.clone());
        Ok(serde_json::json!({
            "value": format!("ek_test_{}", sessions.len()),
            "expires_at": 0,
            "session": {
                "model": session.model,
            },
        }))
    }
}
