use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Infra(#[from] mf_infra::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        use mf_infra::Error as E;

        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Infra(e) => match e.root() {
                E::NotFound(_) | E::UnknownProvider(_) => StatusCode::NOT_FOUND,
                E::Validation(_) | E::InvalidId(_) => StatusCode::BAD_REQUEST,
                E::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                E::MissingEnv(_) | E::Render(_) | E::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = %status, error = %self, "request failed");
        }

        let body = match &self {
            ApiError::Infra(e) => serde_json::json!({
                "error": self.to_string(),
                "phase": e.phase(),
                "step": e.step(),
            }),
            _ => serde_json::json!({ "error": self.to_string() }),
        };
        (status, axum::Json(body)).into_response()
    }
}
