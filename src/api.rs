//! REST side of the chat backend.
//!
//! | Call              | Route                                   |
//! |-------------------|-----------------------------------------|
//! | trigger stream    | `POST /chat/stream/{id}`                |
//! | single-shot search| `POST /chat/stream/{id}/search`         |
//! | history           | `GET  /chat/{id}`                       |
//! | room list         | `GET  /chat/list`                       |
//!
//! Every call sends the session token verbatim in `Authorization`. A 401 maps
//! to [`ChatError::AuthRejected`]; any other failure to
//! [`ChatError::RequestFailed`].

use std::future::Future;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::mission::Mission;
use crate::transcript::{Message, MessageBody};

// -- Request / response types -----------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StreamRequest {
    pub inputs: String,
    pub mission: Mission,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
    pub inputs: String,
    pub mission: Mission,
    /// Ask the backend to refine the query with the model first.
    pub is_model: bool,
    pub top_k: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    Success,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    pub status: SearchStatus,
    #[serde(default)]
    pub searchresult: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HistoryContent {
    Text(String),
    List(Vec<String>),
}

/// One stored turn as returned by the history endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryMessage {
    #[serde(default)]
    pub content: Option<HistoryContent>,
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Room {
    #[serde(default)]
    pub title: String,
    #[serde(deserialize_with = "string_or_number")]
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomList {
    #[serde(default)]
    pub chats: Vec<Room>,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("expected string or number, got {other}"))),
    }
}

impl HistoryMessage {
    /// Map a stored turn onto a transcript message.
    ///
    /// A `role` naming a mission tags the message with it; retrieval missions
    /// with an empty list render as no-results.
    pub fn into_message(self) -> Message {
        if self.role == "user" {
            let text = match self.content {
                Some(HistoryContent::Text(text)) => text,
                Some(HistoryContent::List(items)) => items.join("\n"),
                None => String::new(),
            };
            return Message::user(text);
        }

        let mission = Mission::from_wire(&self.role);
        let body = match self.content {
            Some(HistoryContent::Text(text)) => MessageBody::Text(text),
            Some(HistoryContent::List(items)) => MessageBody::from_results(items),
            None if mission.is_some_and(|m| m.is_retrieval()) => MessageBody::NoResults,
            None => MessageBody::Text(String::new()),
        };
        Message::assistant(body, mission)
    }
}

// -- Backend seam -----------------------------------------------------------

/// The request/response calls a conversation needs.
pub trait ChatBackend: Send + Sync {
    /// Ask the backend to start streaming an answer over the channel.
    /// Resolves on acknowledgement; the answer itself never comes back here.
    fn trigger_stream(
        &self,
        conversation_id: &str,
        request: &StreamRequest,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Run a retrieval and return its finished result list (possibly empty).
    fn search(
        &self,
        conversation_id: &str,
        request: &SearchRequest,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn fetch_history(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Vec<HistoryMessage>>> + Send;
}

// -- HTTP client --------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Self {
        // Builder failure only happens in broken TLS environments; fall back
        // to a default client instead of panicking.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_default();

        ApiClient {
            client,
            base_url: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the rooms of the signed-in user.
    pub async fn list_rooms(&self) -> Result<Vec<Room>> {
        let url = format!("{}/chat/list", self.base_url);
        let resp = self.send(self.client.get(&url), &url).await?;
        let rooms: RoomList = resp.json().await.map_err(|e| ChatError::request(&url, e))?;
        Ok(rooms.chats)
    }

    async fn send(&self, builder: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response> {
        let builder = match &self.token {
            Some(token) => builder.header(reqwest::header::AUTHORIZATION, token),
            None => builder,
        };
        let resp = builder.send().await.map_err(|e| ChatError::request(url, e))?;

        let status = resp.status();
        debug!(url, status = status.as_u16(), "backend replied");
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ChatError::AuthRejected);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = if body.is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                format!("HTTP {}: {}", status.as_u16(), body)
            };
            return Err(ChatError::request(url, detail));
        }
        Ok(resp)
    }
}

impl ChatBackend for ApiClient {
    async fn trigger_stream(&self, conversation_id: &str, request: &StreamRequest) -> Result<()> {
        let url = format!("{}/chat/stream/{}", self.base_url, conversation_id);
        self.send(self.client.post(&url).json(request), &url).await?;
        Ok(())
    }

    async fn search(&self, conversation_id: &str, request: &SearchRequest) -> Result<Vec<String>> {
        let url = format!("{}/chat/stream/{}/search", self.base_url, conversation_id);
        let resp = self.send(self.client.post(&url).json(request), &url).await?;
        let parsed: SearchResponse = resp.json().await.map_err(|e| ChatError::request(&url, e))?;
        match parsed.status {
            SearchStatus::Success => Ok(parsed.searchresult),
            SearchStatus::Error | SearchStatus::Unknown => {
                Err(ChatError::request(&url, "backend reported search status 'error'"))
            }
        }
    }

    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<HistoryMessage>> {
        let url = format!("{}/chat/{}", self.base_url, conversation_id);
        let builder = self.client.get(&url).query(&[("chat_id", conversation_id)]);
        let resp = self.send(builder, &url).await?;
        let history: HistoryResponse = resp.json().await.map_err(|e| ChatError::request(&url, e))?;
        Ok(history.messages)
    }
}
