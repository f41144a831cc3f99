use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::timeout;

use crate::realtime::{RealtimeClient, RealtimeError, RealtimeSession};

pub struct ReqwestRealtimeClient {
    http: reqwest::Client,
    url: String,
    api_key: Arc<str>,
    timeout: Duration,
}

impl ReqwestRealtimeClient {
    pub fn new(url: String, api_key: Arc<str>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            api_key,
            timeout,
        }
    }
}

#[derive(Serialize)]
struct CreateClientSecretRequest<'a> {
    session: &'a RealtimeSession,
}

#[async_trait]
impl RealtimeClient for ReqwestRealtimeClient {
    async fn create_client_secret(
        &self,
        session: &RealtimeSession,
    ) -> Result<serde_json::Value, RealtimeError> {
        let request = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&CreateClientSecretRequest { session });

        let response = match timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) if error.is_timeout() => return Err(RealtimeError::Timeout),
            Ok(Err(error)) => return Err(RealtimeError::Transport(error.to_string())),
            Err(_) => return Err(RealtimeError::Timeout),
        };

        let status = response.status();
        if !status.is_success() {
            let body = match timeout(Duration::from_secs(5), response.text()).await {
                Ok(Ok(text)) => text,
                _ => "<unreadable response body>".into(),
            };
            log::error!("realtime API error {}: {}", status, body);
            return Err(RealtimeError::Status(status.as_u16()));
        }

        match timeout(self.timeout, response.json::<serde_json::Value>()).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(error)) => Err(RealtimeError::Transport(error.to_string())),
            Err(_) => Err(RealtimeError::Timeout),
        }
    }
}
