//! REST adapter for the history and send endpoints.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use shared::{
    domain::Identity,
    error::ApiError,
    protocol::{MessagePayload, SendMessageRequest},
};
use tracing::{debug, warn};
use url::Url;

use crate::{error::ChatError, history::HistoryApi, identity::IdentityResolver, sender::MessageApi};

#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base_url: Url,
    credentials: Option<IdentityResolver>,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> std::result::Result<Self, ChatError> {
        let base_url = Url::parse(base_url.trim()).map_err(|err| ChatError::InvalidUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::InvalidUrl {
                url: base_url.to_string(),
                reason: "url cannot be used as a base".to_string(),
            });
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            credentials: None,
        })
    }

    /// Attaches the session token, read per request, as a bearer credential.
    pub fn with_credentials(mut self, resolver: IdentityResolver) -> Self {
        self.credentials = Some(resolver);
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("base url cannot carry a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self
            .credentials
            .as_ref()
            .and_then(IdentityResolver::credentials)
        {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_messages(&self, request: RequestBuilder) -> Result<Vec<MessagePayload>> {
        let response = ensure_success(self.authorized(request).send().await?).await?;
        let entries: Option<Vec<serde_json::Value>> = response
            .json()
            .await
            .context("invalid message list body")?;
        Ok(decode_entries(entries.unwrap_or_default()))
    }
}

/// Decodes each list entry on its own; entries that do not decode are skipped.
fn decode_entries(entries: Vec<serde_json::Value>) -> Vec<MessagePayload> {
    let total = entries.len();
    let messages: Vec<MessagePayload> = entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<MessagePayload>(entry) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(error = %err, "skipping undecodable message");
                None
            }
        })
        .collect();
    if messages.len() < total {
        debug!(total, kept = messages.len(), "message list had undecodable entries");
    }
    messages
}

/// Maps a non-2xx response to an error, preferring the backend's own message.
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(anyhow::Error::new(ChatError::Api(api_error))
            .context(format!("{status} from {url}"))),
        Err(_) => Err(anyhow!("{status} from {url}")),
    }
}

#[async_trait]
impl HistoryApi for HttpBackend {
    async fn fetch_conversation(
        &self,
        self_identity: &Identity,
        peer: &Identity,
    ) -> Result<Vec<MessagePayload>> {
        let url = self.endpoint(&["api", "messages", "conversation"])?;
        let request = self
            .http
            .get(url)
            .query(&[("user1", self_identity.as_str()), ("user2", peer.as_str())]);
        self.fetch_messages(request).await
    }

    async fn fetch_with_peer(&self, peer: &Identity) -> Result<Vec<MessagePayload>> {
        let url = self.endpoint(&["api", "messages", peer.as_str()])?;
        self.fetch_messages(self.http.get(url)).await
    }
}

#[async_trait]
impl MessageApi for HttpBackend {
    async fn post_message(&self, request: &SendMessageRequest) -> Result<MessagePayload> {
        let url = self.endpoint(&["api", "messages"])?;
        let response = self
            .authorized(self.http.post(url).json(request))
            .send()
            .await?;
        let created = ensure_success(response)
            .await?
            .json()
            .await
            .context("invalid created message body")?;
        Ok(created)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
