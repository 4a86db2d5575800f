// HTTP Handlers
//
// Thin request/response mapping over registration, the supervisor and the
// session store.

use crate::listener::ListenerError;
use crate::server::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use wagate_channels::OutgoingMessage;
use wagate_session::{validate_session_id, SessionError};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Error body `{"code": <status>, "msg": <text>}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "code": self.status.as_u16(), "msg": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("decode error: {}", rejection.body_text()))
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Health
// ============================================================================

pub async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

// ============================================================================
// Registration
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterSessionRequest {
    #[serde(default)]
    pub session_id: String,
}

pub async fn register_session(
    State(state): State<AppState>,
    payload: Result<Json<RegisterSessionRequest>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
    let Json(request) = payload?;
    if request.session_id.trim().is_empty() {
        return Err(ApiError::bad_request("session_id is required"));
    }

    match state.registration.register(&request.session_id).await {
        Ok(()) => Ok(Json(json!({
            "session_id": request.session_id,
            "status": "listening",
        }))),
        Err(ListenerError::InvalidSessionId(reason)) => Err(ApiError::bad_request(reason)),
        Err(e) => Err(ApiError::internal(format!("error listening: {}", e))),
    }
}

// ============================================================================
// Sending
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub chat_id: String,
    pub text: String,
    pub session_name: String,
}

#[derive(Debug, Deserialize)]
pub struct SendImageRequest {
    pub session_name: String,
    pub chat_id: String,
    pub image_url: String,
    #[serde(default)]
    pub caption: String,
}

async fn send(state: &AppState, session_id: &str, message: OutgoingMessage) -> ApiResult<Json<JsonValue>> {
    let entry = state
        .supervisor
        .authenticated_connection_for_session(session_id)
        .await
        .map_err(|e| ApiError::bad_request(format!("session not registered: {}", e)))?;

    let echo = serde_json::to_value(&message).map_err(|e| ApiError::internal(e.to_string()))?;
    let message_id = entry
        .connection
        .send(message)
        .await
        .map_err(|e| ApiError::internal(format!("error sending message: {}", e)))?;
    tracing::debug!(session_id = %session_id, message_id = %message_id, "message sent");
    Ok(Json(echo))
}

pub async fn send_message(
    State(state): State<AppState>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
    let Json(request) = payload?;
    let message = OutgoingMessage::Text {
        chat_id: request.chat_id,
        text: request.text,
    };
    send(&state, &request.session_name, message).await
}

pub async fn send_image(
    State(state): State<AppState>,
    payload: Result<Json<SendImageRequest>, JsonRejection>,
) -> ApiResult<Json<JsonValue>> {
    let Json(request) = payload?;
    // Unregistered sessions fail before the image is fetched.
    state
        .supervisor
        .entry(&request.session_name)
        .await
        .ok_or_else(|| ApiError::bad_request("session not registered"))?;

    let (content_type, bytes) = fetch_image(&state.http, &request.image_url).await?;
    let message = OutgoingMessage::Image {
        chat_id: request.chat_id,
        content_type,
        caption: request.caption,
        bytes,
    };
    send(&state, &request.session_name, message).await
}

async fn fetch_image(client: &reqwest::Client, url: &str) -> ApiResult<(String, Vec<u8>)> {
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| ApiError::internal(format!("error fetching image: {}", e)))?;

    let declared = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_string())
        .filter(|v| v.starts_with("image/"));

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::internal(format!("error reading image: {}", e)))?
        .to_vec();

    let content_type = declared
        .or_else(|| {
            image::guess_format(&bytes)
                .ok()
                .map(|format| format.to_mime_type().to_string())
        })
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());
    Ok((content_type, bytes))
}

// ============================================================================
// Lookups
// ============================================================================

pub async fn get_qr_code(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    validate_session_id(&session_id).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let path = state.qr_files.path_for(&session_id);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ApiError::not_found("no qr code for session"))
        }
        Err(e) => Err(ApiError::internal(format!("error reading qr code: {}", e))),
    }
}

pub async fn get_session_info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    match state.store.read_session(&session_id).await {
        Ok(session) => serde_json::to_value(session)
            .map(Json)
            .map_err(|e| ApiError::internal(e.to_string())),
        Err(SessionError::NotFound(_)) => Err(ApiError::not_found("session not found")),
        Err(SessionError::InvalidSessionId(reason)) => Err(ApiError::bad_request(reason)),
        Err(e) => Err(ApiError::internal(format!("error reading session: {}", e))),
    }
}

pub async fn get_active_connection_info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<JsonValue>> {
    let entry = state
        .supervisor
        .authenticated_connection_for_session(&session_id)
        .await
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    let info = entry
        .connection
        .info()
        .await
        .map_err(|e| ApiError::internal(format!("error reading connection info: {}", e)))?;
    Ok(Json(json!({
        "connection_info": info,
        "session_info": entry.session,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::test_server;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use httpmock::prelude::*;
    use tower::ServiceExt;
    use wagate_channels::testing::MockConnection;

    async fn body_json(response: Response) -> JsonValue {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_livez() {
        let (status, body) = livez().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_register_bad_body() {
        let t = test_server();
        let response = t
            .server
            .router()
            .oneshot(post_json("/register-session/", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], 400);
    }

    #[tokio::test]
    async fn test_register_empty_id() {
        let t = test_server();
        let response = t
            .server
            .router()
            .oneshot(post_json("/register-session/", r#"{"session_id": ""}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(t.connector.created().is_empty());
    }

    #[tokio::test]
    async fn test_register_then_send() {
        let t = test_server();
        let conn = MockConnection::new();
        t.connector.push(conn.clone());
        let app = t.server.router();

        let response = app
            .clone()
            .oneshot(post_json("/register-session/", r#"{"session_id": "s1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"session_id": "s1", "status": "listening"})
        );

        let response = app
            .oneshot(post_json(
                "/send-message/",
                r#"{"chat_id": "c1", "text": "hi", "session_name": "s1"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"type": "text", "chat_id": "c1", "text": "hi"})
        );
        assert_eq!(conn.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_register_failure_is_500() {
        let t = test_server();
        let conn = MockConnection::new();
        conn.set_login_error(Some(wagate_channels::TransportError::Timeout));
        t.connector.push(conn);

        let response = t
            .server
            .router()
            .oneshot(post_json("/register-session/", r#"{"session_id": "s1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_send_to_unknown_session() {
        let t = test_server();
        let response = t
            .server
            .router()
            .oneshot(post_json(
                "/send-message/",
                r#"{"chat_id": "c1", "text": "hi", "session_name": "ghost"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_send_image_sniffs_content_type() {
        let png: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/cat");
            then.status(200)
                .header("content-type", "application/octet-stream")
                .body(png);
        });

        let t = test_server();
        let conn = MockConnection::new();
        t.connector.push(conn.clone());
        t.server.registration().register("s1").await.expect("registered");

        let body = json!({
            "session_name": "s1",
            "chat_id": "c1",
            "image_url": server.url("/cat"),
            "caption": "look",
        });
        let response = t
            .server
            .router()
            .oneshot(post_json("/send-image/", &body.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["content_type"], "image/png");

        match &conn.sent()[0] {
            OutgoingMessage::Image { bytes, caption, .. } => {
                assert_eq!(bytes.as_slice(), png);
                assert_eq!(caption, "look");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_qr_code_is_404() {
        let t = test_server();
        let response = t
            .server
            .router()
            .oneshot(Request::get("/get-qr-code/s1/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_qr_code_served_as_png() {
        let t = test_server();
        let path = t.server.state().qr_files.path_for("s1");
        crate::qr::write_png("2@abc", &path).expect("png");

        let response = t
            .server
            .router()
            .oneshot(Request::get("/get-qr-code/s1/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    }

    #[tokio::test]
    async fn test_session_info() {
        let t = test_server();
        let app = t.server.router();

        let response = app
            .clone()
            .oneshot(Request::get("/get-session-info/s1/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        t.server.registration().register("s1").await.expect("registered");
        let response = app
            .oneshot(Request::get("/get-session-info/s1/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["session_id"], "s1");
    }

    #[tokio::test]
    async fn test_active_connection_info() {
        let t = test_server();
        let app = t.server.router();

        let response = app
            .clone()
            .oneshot(
                Request::get("/get-active-connection-info/s1/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        t.server.registration().register("s1").await.expect("registered");
        let response = app
            .oneshot(
                Request::get("/get-active-connection-info/s1/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["connection_info"]["platform"], "mock");
        assert_eq!(json["session_info"]["session_id"], "s1");
    }
}
