/// HTTP client for the chat server's request/response endpoints
///
/// Endpoints:
///   POST /login                    body: {"username":"...","password":"..."}
///   POST /register                 body: {"username":"...","password":"..."}
///   GET  /conversations/:user_id
///   GET  /messages/:conversation_id
///   GET  /search-users?q=...
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::fetcher::StateFetcher;
use crate::messenger_types::{Conversation, ConversationId, Identity, Message, UserId};
use crate::session::{Authenticator, Session};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

type HttpClient = Client<HttpConnector, Full<Bytes>>;

#[derive(Serialize)]
struct CredentialsBody<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    user: Identity,
}

/// Server API over plain HTTP/1.1
#[derive(Clone)]
pub struct HttpApi {
    client: HttpClient,
    base_url: String,
    request_timeout: Duration,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url,
            request_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.server_url.clone(), config.request_timeout)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, path, None).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let body = serde_json::to_vec(body).map_err(ChatError::Serialization)?;
        self.request(Method::POST, path, Some(body)).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T> {
        let uri = format!("{}{}", self.base_url, path);
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header("Accept", "application/json");
        let body = match body {
            Some(b) => {
                builder = builder.header("Content-Type", "application/json");
                Full::new(Bytes::from(b))
            }
            None => Full::new(Bytes::new()),
        };
        let req = builder
            .body(body)
            .map_err(|e| ChatError::Http(format!("invalid request {}: {}", uri, e)))?;

        debug!("{} {}", method, uri);
        let resp = timeout(self.request_timeout, self.client.request(req))
            .await
            .map_err(|_| ChatError::Timeout(format!("{} {}", method, uri)))?
            .map_err(|e| ChatError::Http(format!("{} {}: {}", method, uri, e)))?;

        let status = resp.status();
        let bytes = timeout(self.request_timeout, resp.into_body().collect())
            .await
            .map_err(|_| ChatError::Timeout(format!("{} {} (body)", method, uri)))?
            .map_err(|e| ChatError::Http(format!("{} {} body: {}", method, uri, e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(ChatError::Rejected {
                status: status.as_u16(),
                detail: error_detail(&bytes, status.canonical_reason()),
            });
        }
        serde_json::from_slice(&bytes).map_err(ChatError::Serialization)
    }
}

/// Pull the human-readable reason out of an error body
fn error_detail(body: &[u8], reason: Option<&str>) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for key in ["detail", "error"] {
            match value.get(key) {
                Some(serde_json::Value::String(s)) => return s.clone(),
                Some(other) => return other.to_string(),
                None => {}
            }
        }
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    if text.is_empty() {
        reason.unwrap_or("unknown error").to_string()
    } else {
        text
    }
}

/// Rejections from the auth endpoints go to the user verbatim
fn auth_error(e: ChatError) -> ChatError {
    match e {
        ChatError::Rejected { detail, .. } => ChatError::Auth(detail),
        other => other,
    }
}

#[async_trait]
impl StateFetcher for HttpApi {
    async fn conversations(&self, user: UserId) -> Result<Vec<Conversation>> {
        self.get_json(&format!("/conversations/{}", user)).await
    }

    async fn message_history(&self, conversation: ConversationId) -> Result<Vec<Message>> {
        self.get_json(&format!("/messages/{}", conversation)).await
    }

    async fn search_identities(&self, query: &str) -> Result<Vec<Identity>> {
        self.get_json(&format!("/search-users?q={}", urlencoding::encode(query)))
            .await
    }
}

#[async_trait]
impl Authenticator for HttpApi {
    async fn login(&self, username: &str, password: &str) -> Result<Session> {
        let resp: LoginResponse = self
            .post_json("/login", &CredentialsBody { username, password })
            .await
            .map_err(auth_error)?;
        info!("Logged in as {} (id {})", resp.user.username, resp.user.id);
        Ok(Session {
            identity: resp.user,
            credential: resp.access_token,
        })
    }

    async fn register(&self, username: &str, password: &str) -> Result<Identity> {
        let identity: Identity = self
            .post_json("/register", &CredentialsBody { username, password })
            .await
            .map_err(auth_error)?;
        info!("Registered {} (id {})", identity.username, identity.id);
        Ok(identity)
    }
}
