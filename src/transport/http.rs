use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use urlencoding::encode;

use super::{Session, Transport, TransportError};
use crate::model::{ConversationSpan, IdRange, MessageRecord};

const REQUEST_TIMEOUT_SECS: u64 = 60;

/// JSON-over-HTTP transport.
///
/// Endpoints, relative to `api_url`:
/// `GET /v1/conversations/{entity}/span` and
/// `GET /v1/conversations/{entity}/messages?start=&before=&limit=`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    api_url: String,
    api_key: Option<String>,
    entity: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    messages: Vec<MessageRecord>,
}

impl HttpTransport {
    pub fn new(api_url: &str, api_key: Option<String>, entity: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            entity: entity.to_string(),
        }
    }

    fn url(&self, entity: &str, suffix: &str) -> String {
        format!(
            "{}/v1/conversations/{}/{}",
            self.api_url,
            encode(entity),
            suffix
        )
    }

    fn build_client() -> Result<Client, TransportError> {
        Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|err| TransportError::Fatal(format!("failed to build HTTP client: {err}")))
    }
}

fn classify_status(status: StatusCode, body: &str) -> TransportError {
    let retryable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;
    let message = format!("request failed ({status}): {body}");
    if retryable {
        TransportError::Retryable(message)
    } else {
        TransportError::Fatal(message)
    }
}

async fn get_json<T: for<'de> Deserialize<'de>>(
    client: &Client,
    url: &str,
    api_key: Option<&str>,
    query: &[(&str, String)],
) -> Result<T, TransportError> {
    let mut request = client.get(url).query(query);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    let response = request
        .send()
        .await
        .map_err(|err| TransportError::Retryable(format!("network error: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }
    response
        .json::<T>()
        .await
        .map_err(|err| TransportError::Retryable(format!("failed to parse response: {err}")))
}

#[async_trait]
impl Transport for HttpTransport {
    type Session = HttpSession;

    async fn resolve(&self, entity: &str) -> Result<ConversationSpan, TransportError> {
        let client = Self::build_client()?;
        let url = self.url(entity, "span");
        debug!(%url, "resolving conversation span");
        get_json(&client, &url, self.api_key.as_deref(), &[]).await
    }

    async fn open_session(&self, index: usize) -> Result<Self::Session, TransportError> {
        debug!(session = index, "opening HTTP session");
        Ok(HttpSession {
            client: Self::build_client()?,
            url: self.url(&self.entity, "messages"),
            api_key: self.api_key.clone(),
        })
    }
}

pub struct HttpSession {
    client: Client,
    url: String,
    api_key: Option<String>,
}

#[async_trait]
impl Session for HttpSession {
    async fn fetch_page(
        &mut self,
        range: IdRange,
        before_id: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, TransportError> {
        let query = [
            ("start", range.start.to_string()),
            ("before", before_id.min(range.end).to_string()),
            ("limit", limit.to_string()),
        ];
        let response: MessagesResponse =
            get_json(&self.client, &self.url, self.api_key.as_deref(), &query).await?;
        Ok(response.messages)
    }
}
