/// Backend REST collaborator
///
/// Endpoints:
///   GET   /current-user/
///   GET   /negotiation-requests/
///   POST  /negotiation-requests/                 body: RequestDraft
///   PATCH /negotiation-requests/:id/             body: {"accepted": bool}
///   GET   /sessions/:id/
///   POST  /sessions/:id/complete/
///   GET   /profiles/:user_id/exchange-history/
use crate::chat::protocol::decode_history_entry;
use crate::config::Config;
use crate::error::{Result, SwapError};
use crate::negotiation_types::{
    CompletionOutcome, ExchangeRecord, NegotiationRequest, RequestDraft, RequestId,
    SessionBootstrap, SessionId, SessionPhase, UserId, UserRef,
};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Request/response operations the negotiation core needs from the server
#[async_trait]
pub trait Backend: Send + Sync {
    /// The authenticated user
    async fn current_user(&self) -> Result<UserRef>;

    /// Every request the user sent or received, in server order
    async fn list_requests(&self) -> Result<Vec<NegotiationRequest>>;

    async fn create_request(&self, draft: &RequestDraft) -> Result<NegotiationRequest>;

    /// Accept or reject; the returned copy carries the chat id on acceptance
    async fn respond_request(&self, id: &RequestId, accepted: bool) -> Result<NegotiationRequest>;

    /// Session, history, identity and completion authority in one call
    async fn bootstrap_session(&self, id: &SessionId) -> Result<SessionBootstrap>;

    /// Idempotent completion request
    async fn complete_session(&self, id: &SessionId) -> Result<CompletionOutcome>;

    async fn exchange_history(&self, user: &UserId) -> Result<Vec<ExchangeRecord>>;
}

#[derive(Debug, Deserialize)]
struct SessionDto {
    id: SessionId,
    #[serde(default)]
    title: String,
    participants: Vec<UserRef>,
    /// Handle of the party who confirms receipt
    receiver: String,
    #[serde(default = "default_phase")]
    state: SessionPhase,
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

fn default_phase() -> SessionPhase {
    SessionPhase::Open
}

#[derive(Debug, Serialize)]
struct RespondBody {
    accepted: bool,
}

#[derive(Debug, Deserialize)]
struct CompleteDto {
    status: CompletionOutcome,
}

/// `Backend` over HTTP with bearer auth
#[derive(Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    config: Config,
}

impl HttpBackend {
    pub fn new(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self.config.token.as_deref().ok_or(SwapError::NotAuthenticated)?;
        let url = self.config.api_url(path);
        debug!("{} {}", method, url);
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn fetch_session(&self, id: &SessionId) -> Result<SessionDto> {
        let path = format!("/sessions/{}/", urlencoding::encode(id.as_str()));
        let resp = self.request(Method::GET, &path)?.send().await?;
        json_body(resp, "session", "fetch").await
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn current_user(&self) -> Result<UserRef> {
        let resp = self.request(Method::GET, "/current-user/")?.send().await?;
        json_body(resp, "user", "fetch").await
    }

    async fn list_requests(&self) -> Result<Vec<NegotiationRequest>> {
        let resp = self
            .request(Method::GET, "/negotiation-requests/")?
            .send()
            .await?;
        json_body(resp, "request", "list").await
    }

    async fn create_request(&self, draft: &RequestDraft) -> Result<NegotiationRequest> {
        let resp = self
            .request(Method::POST, "/negotiation-requests/")?
            .json(draft)
            .send()
            .await?;
        json_body(resp, "request", "create").await
    }

    async fn respond_request(&self, id: &RequestId, accepted: bool) -> Result<NegotiationRequest> {
        let path = format!("/negotiation-requests/{}/", urlencoding::encode(id.as_str()));
        let resp = self
            .request(Method::PATCH, &path)?
            .json(&RespondBody { accepted })
            .send()
            .await?;
        json_body(resp, "request", "respond to").await
    }

    async fn bootstrap_session(&self, id: &SessionId) -> Result<SessionBootstrap> {
        let (session, identity) = tokio::try_join!(self.fetch_session(id), self.current_user())?;

        if &session.id != id {
            return Err(SwapError::Protocol(format!(
                "Asked for session {}, got {}",
                id, session.id
            )));
        }

        let mut history = Vec::with_capacity(session.messages.len());
        for entry in session.messages {
            match decode_history_entry(entry, &session.id) {
                Ok(message) => history.push(message),
                Err(e) => warn!("Dropping history entry of session {}: {}", session.id, e),
            }
        }

        Ok(SessionBootstrap {
            session_id: session.id,
            title: session.title,
            participants: session.participants,
            completion_authority: session.receiver,
            phase: session.state,
            history,
            identity,
        })
    }

    async fn complete_session(&self, id: &SessionId) -> Result<CompletionOutcome> {
        let path = format!("/sessions/{}/complete/", urlencoding::encode(id.as_str()));
        let resp = self.request(Method::POST, &path)?.send().await?;
        let dto: CompleteDto = json_body(resp, "session", "complete").await?;
        Ok(dto.status)
    }

    async fn exchange_history(&self, user: &UserId) -> Result<Vec<ExchangeRecord>> {
        let path = format!(
            "/profiles/{}/exchange-history/",
            urlencoding::encode(user.as_str())
        );
        let resp = self.request(Method::GET, &path)?.send().await?;
        json_body(resp, "history", "fetch").await
    }
}

/// Map the status line, then decode the JSON body
async fn json_body<T: DeserializeOwned>(
    resp: Response,
    entity: &'static str,
    action: &'static str,
) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(status_error(status, entity, action, body));
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SwapError::Protocol(format!("Cannot {} {}: bad body: {}", action, entity, e)))
}

fn status_error(
    status: StatusCode,
    entity: &'static str,
    action: &'static str,
    body: String,
) -> SwapError {
    match status {
        StatusCode::UNAUTHORIZED => SwapError::NotAuthenticated,
        StatusCode::FORBIDDEN => SwapError::Forbidden(format!("cannot {} {}: {}", action, entity, body)),
        StatusCode::NOT_FOUND => SwapError::NotFound(format!("{} ({})", entity, action)),
        StatusCode::CONFLICT => SwapError::InvalidTransition {
            entity,
            from: if body.is_empty() {
                "server state".to_string()
            } else {
                body
            },
            action,
        },
        other => SwapError::Network(format!("Cannot {} {}: HTTP {}", action, entity, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "session", "fetch", String::new()),
            SwapError::NotAuthenticated
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "session", "fetch", String::new()),
            SwapError::NotFound(_)
        ));
        let conflict = status_error(StatusCode::CONFLICT, "request", "respond to", "accepted".into());
        assert!(conflict.is_state_violation());
        assert!(status_error(StatusCode::BAD_GATEWAY, "request", "list", String::new()).is_retryable());
    }

    #[tokio::test]
    async fn test_missing_token_is_not_authenticated() {
        let backend = HttpBackend::new(Config::default()).unwrap();
        let err = backend.current_user().await.unwrap_err();
        assert!(matches!(err, SwapError::NotAuthenticated));
    }

    #[test]
    fn test_session_dto_defaults() {
        let dto: SessionDto = serde_json::from_str(
            r#"{"id": 5, "participants": [], "receiver": "bia"}"#,
        )
        .unwrap();
        assert_eq!(dto.state, SessionPhase::Open);
        assert!(dto.messages.is_empty());
    }
}
