//! REST query surface

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::chat::ChatError;
use crate::server::AppState;
use crate::session::{Message, SessionError, SessionSummary, Source};

/// JSON error response `{"error": {code, message, retryable, timestamp}}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR",
            message: message.into(),
            retryable: false,
            retry_after_secs: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: message.into(),
            retryable: false,
            retry_after_secs: None,
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status = match &err {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::RequestInProgress(_) => StatusCode::CONFLICT,
            ChatError::ProviderRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            ChatError::ProviderTransport(_) | ChatError::ProviderInvocation(_) => StatusCode::BAD_GATEWAY,
        };
        let retry_after_secs = match &err {
            ChatError::ProviderRateLimited { retry_after_secs, .. } => *retry_after_secs,
            _ => None,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            retry_after_secs,
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ChatError::from(err).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "retryable": self.retryable,
                "timestamp": Utc::now(),
            }
        }));
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store = state.chat.store();
    Json(json!({
        "status": "healthy",
        "provider": state.chat.provider_name(),
        "sessions": store.session_count().await,
        "messages": store.total_message_count().await,
        "connections": state.multiplexer.connection_count(),
        "activeGenerations": state.chat.active_generations(),
        "timestamp": Utc::now(),
    }))
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub sessions: Vec<SessionSummary>,
    pub count: usize,
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionList> {
    let sessions = state.chat.store().list_sessions().await;
    Json(SessionList {
        count: sessions.len(),
        sessions,
    })
}

pub async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<SessionSummary>) {
    let session = state.chat.store().create_session().await;
    (StatusCode::CREATED, Json(session.summary()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub session_id: String,
    pub message_id: String,
    pub content: String,
    pub sources: Vec<Source>,
    pub timestamp: DateTime<Utc>,
}

/// Non-streaming exchange. The exchange runs in its own task so a client
/// hanging up does not abandon the generation.
pub async fn post_chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<Json<ChatResponse>> {
    let Json(request) = payload?;
    state.chat.validate(&request.message)?;

    let session_id = match request.session_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => state.chat.store().get_or_create(&id).await.id,
        None => state.chat.store().create_session().await.id,
    };

    let chat = state.chat.clone();
    let exchange_session = session_id.clone();
    let message = tokio::spawn(async move { chat.ask(&exchange_session, &request.message).await })
        .await
        .map_err(|e| {
            error!("Chat task failed: {}", e);
            ApiError::internal("chat task failed")
        })??;

    Ok(Json(ChatResponse {
        session_id,
        message_id: message.id,
        content: message.content,
        sources: message.sources.unwrap_or_default(),
        timestamp: message.timestamp,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub count: usize,
}

pub async fn session_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> ApiResult<Json<HistoryResponse>> {
    let Query(params) = params?;
    let messages = state.chat.store().list_messages(&session_id, params.limit).await?;
    Ok(Json(HistoryResponse {
        session_id,
        count: messages.len(),
        messages,
    }))
}

pub async fn delete_session(State(state): State<AppState>, Path(session_id): Path<String>) -> Json<serde_json::Value> {
    let deleted = state.chat.store().delete_session(&session_id).await;
    if !deleted {
        info!("Delete requested for absent session {}", session_id);
    }
    Json(json!({ "sessionId": session_id, "deleted": deleted }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatService, ChatSettings};
    use crate::provider::testing::ScriptedProvider;
    use crate::provider::ProviderError;
    use crate::server::build_router;
    use crate::session::{HistoryFormatter, SessionStore, StoreLimits};
    use axum::{body::Body, http::Request, Router};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(provider: ScriptedProvider) -> (Router, AppState) {
        app_with(provider, StoreLimits::default())
    }

    fn app_with(provider: ScriptedProvider, limits: StoreLimits) -> (Router, AppState) {
        let store = Arc::new(SessionStore::new(limits));
        let chat = Arc::new(ChatService::new(
            store,
            Arc::new(provider),
            HistoryFormatter::default(),
            ChatSettings::default(),
        ));
        let state = AppState::new(chat);
        (build_router(state.clone()), state)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let (router, state) = app(ScriptedProvider::default());
        state.chat.store().create_session().await;

        let (status, body) = send(&router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"], 1);
        assert_eq!(body["provider"], "scripted");
        assert_eq!(body["activeGenerations"], 0);
    }

    #[tokio::test]
    async fn test_post_chat_round_trip_and_history() {
        let (router, _state) = app(ScriptedProvider::answering(&["Hi", " there"], vec![Source::new("doc.pdf", 0.9)]));

        let (status, body) = send(
            &router,
            json_request("POST", "/api/chat", json!({"sessionId": "s1", "message": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessionId"], "s1");
        assert_eq!(body["content"], "Hi there");
        assert_eq!(body["sources"][0]["document"], "doc.pdf");

        let (status, body) = send(&router, get("/api/chat/s1/history")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "Hi there");

        let (_, body) = send(&router, get("/api/chat/s1/history?limit=1")).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["messages"][0]["role"], "assistant");
    }

    #[tokio::test]
    async fn test_post_chat_without_session_creates_one() {
        let (router, state) = app(ScriptedProvider::answering(&["ok"], Vec::new()));
        let (status, body) = send(&router, json_request("POST", "/api/chat", json!({"message": "hi"}))).await;

        assert_eq!(status, StatusCode::OK);
        let session_id = body["sessionId"].as_str().unwrap().to_string();
        assert!(state.chat.store().contains(&session_id).await);
    }

    #[tokio::test]
    async fn test_post_chat_errors() {
        let (router, _state) = app(ScriptedProvider::answering(&["ok"], Vec::new()));
        let (status, body) = send(&router, json_request("POST", "/api/chat", json!({"message": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["retryable"], false);

        let (status, body) = send(&router, json_request("POST", "/api/chat", json!({"sessionId": "s1"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (router, _state) = app(ScriptedProvider::failing(ProviderError::RateLimited {
            message: "slow down".to_string(),
            retry_after_secs: Some(4),
        }));
        let response = router
            .clone()
            .oneshot(json_request("POST", "/api/chat", json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "4");

        let (router, _state) = app(ScriptedProvider::failing(ProviderError::Transport("down".to_string())));
        let (status, body) = send(&router, json_request("POST", "/api/chat", json!({"message": "hi"}))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "PROVIDER_TRANSPORT_ERROR");
        assert_eq!(body["error"]["retryable"], true);
    }

    #[tokio::test]
    async fn test_invalid_chat_keeps_resident_sessions() {
        let limits = StoreLimits {
            max_sessions: 1,
            ..Default::default()
        };
        let (router, state) = app_with(ScriptedProvider::answering(&["ok"], Vec::new()), limits);
        state.chat.store().get_or_create("keep").await;

        let (status, _) = send(&router, json_request("POST", "/api/chat", json!({"message": "   "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let oversized = "x".repeat(ChatSettings::default().max_message_chars + 1);
        let (status, body) = send(
            &router,
            json_request("POST", "/api/chat", json!({"sessionId": "other", "message": oversized})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let sessions: Vec<String> = state.chat.store().list_sessions().await.into_iter().map(|s| s.id).collect();
        assert_eq!(sessions, vec!["keep"]);
    }

    #[tokio::test]
    async fn test_history_of_missing_session_is_not_found() {
        let (router, _state) = app(ScriptedProvider::default());
        let (status, body) = send(&router, get("/api/chat/missing/history")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_sessions_create_list_delete() {
        let (router, _state) = app(ScriptedProvider::default());

        let (status, created) = send(&router, json_request("POST", "/api/sessions", json!({}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["messageCount"], 0);

        let (_, listed) = send(&router, get("/api/sessions")).await;
        assert_eq!(listed["count"], 1);
        assert_eq!(listed["sessions"][0]["id"], id.as_str());

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/chat/{}", id))
                .body(Body::empty())
                .unwrap()
        };
        let (status, body) = send(&router, delete()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], true);

        let (status, body) = send(&router, delete()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], false);

        let (_, listed) = send(&router, get("/api/sessions")).await;
        assert_eq!(listed["count"], 0);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(ApiError::from(ChatError::Cancelled).status.as_u16(), 499);
        assert_eq!(
            ApiError::from(ChatError::RequestInProgress("s".into())).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(ChatError::ProviderInvocation("bad".into())).status,
            StatusCode::BAD_GATEWAY
        );
    }
}
