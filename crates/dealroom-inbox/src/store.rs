//! HTTP client for the conversation store.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use url::Url;
use uuid::Uuid;

use dealroom_types::api::{CreateConversationResponse, ErrorResponse, SendMessageRequest};
use dealroom_types::models::{Conversation, Message};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl StoreError {
    /// Transient failures are worth surfacing as "try again".
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

/// Anything that can append a message to a conversation. The thread
/// controller sends through this so tests can swap the HTTP client out.
pub trait MessageSink {
    fn append_message(
        &self,
        conversation_id: Uuid,
        content: &str,
    ) -> impl Future<Output = Result<Message, StoreError>> + Send;
}

/// Which conversations a list call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Conversations the caller participates in.
    User,
    /// Every conversation of a startup (founders only).
    Startup(Uuid),
}

#[derive(Clone)]
pub struct HttpStore {
    client: Client,
    base: Url,
    token: String,
}

impl HttpStore {
    pub fn new(base: Url, token: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base,
            token: token.into(),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn list_conversations(&self, scope: Scope) -> Result<Vec<Conversation>, StoreError> {
        let path = match scope {
            Scope::User => "conversations".to_string(),
            Scope::Startup(id) => format!("startups/{}/conversations", id),
        };
        self.fetch(self.client.get(self.endpoint(&path)?)).await
    }

    /// Open (or reopen) the caller's conversation with a startup.
    pub async fn create_conversation(&self, startup_id: Uuid) -> Result<CreateConversationResponse, StoreError> {
        let url = self.endpoint(&format!("startups/{}/conversations", startup_id))?;
        self.fetch(self.client.post(url)).await
    }

    pub async fn get_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let url = self.endpoint(&format!("conversations/{}/messages", conversation_id))?;
        self.fetch(self.client.get(url)).await
    }

    async fn send_message(&self, conversation_id: Uuid, content: String) -> Result<Message, StoreError> {
        let url = self.endpoint(&format!("conversations/{}/messages", conversation_id))?;
        let body = SendMessageRequest { content, kind: None };
        self.fetch(self.client.post(url).json(&body)).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        self.base
            .join(path)
            .map_err(|e| StoreError::Decode(format!("bad endpoint {}: {}", path, e)))
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, StoreError> {
        let resp = request.bearer_auth(&self.token).send().await?;
        Ok(check(resp).await?.json::<T>().await?)
    }
}

impl MessageSink for HttpStore {
    fn append_message(
        &self,
        conversation_id: Uuid,
        content: &str,
    ) -> impl Future<Output = Result<Message, StoreError>> + Send {
        self.send_message(conversation_id, content.to_string())
    }
}

async fn check(resp: Response) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or(body);

    Err(StoreError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_resolve_against_base() {
        let store = HttpStore::new(Url::parse("http://localhost:3000/api/").unwrap(), "t").unwrap();
        let id = Uuid::nil();

        assert_eq!(
            store.endpoint(&format!("conversations/{}/messages", id)).unwrap().as_str(),
            format!("http://localhost:3000/api/conversations/{}/messages", id)
        );
        assert_eq!(
            store.endpoint("conversations").unwrap().as_str(),
            "http://localhost:3000/api/conversations"
        );
    }

    #[test]
    fn transient_errors() {
        assert!(StoreError::Network("reset".into()).is_transient());
        assert!(StoreError::Rejected { status: 503, message: "busy".into() }.is_transient());
        assert!(!StoreError::Rejected { status: 403, message: "no".into() }.is_transient());
        assert!(!StoreError::Decode("eof".into()).is_transient());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let store = HttpStore::new(Url::parse("http://127.0.0.1:9/").unwrap(), "t").unwrap();
        let err = store.append_message(Uuid::nil(), "hi").await.unwrap_err();
        assert!(matches!(err, StoreError::Network(_)));
    }
}
