use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use std::sync::Arc;
use tracing::warn;

/// HTTP Basic credentials every request must carry. With no credentials
/// configured the broker runs open.
#[derive(Clone)]
pub struct BasicAuthValidator {
    credentials: Option<(String, String)>,
}

impl BasicAuthValidator {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self {
            credentials: username.zip(password),
        }
    }

    pub fn is_open(&self) -> bool {
        self.credentials.is_none()
    }

    pub fn check(&self, headers: &HeaderMap) -> bool {
        let Some((username, password)) = &self.credentials else {
            return true;
        };

        let Some(raw) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
        else {
            return false;
        };

        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(raw) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, pass)) = decoded.split_once(':') else {
            return false;
        };

        user == username && pass == password
    }
}

pub async fn auth_middleware(
    State(validator): State<Arc<BasicAuthValidator>>,
    request: Request,
    next: Next,
) -> Response {
    if validator.check(request.headers()) {
        return next.run(request).await;
    }

    warn!(uri = %request.uri(), "rejected unauthenticated request");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"account-broker\"")],
        "unauthorized",
    )
        .into_response()
}
