use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use mentora_core::error::MentoraError;

/// JSON API error type for REST endpoints.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("api error: {:#}", err);
        Self::internal(format!("{:#}", err))
    }
}

impl From<MentoraError> for ApiError {
    fn from(err: MentoraError) -> Self {
        match &err {
            MentoraError::NotFound(_) => Self::not_found(err.to_string()),
            MentoraError::InvalidInput(_) => Self::bad_request(err.to_string()),
            MentoraError::Storage(_) => {
                tracing::warn!("api storage error: {}", err);
                Self::unavailable(err.to_string())
            }
            _ => {
                tracing::error!("api error: {}", err);
                Self::internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (MentoraError::InvalidInput("empty".into()), StatusCode::BAD_REQUEST),
            (MentoraError::NotFound("session".into()), StatusCode::NOT_FOUND),
            (MentoraError::Storage("locked".into()), StatusCode::SERVICE_UNAVAILABLE),
            (MentoraError::Persistence("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }
}
