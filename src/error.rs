use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub error_type: String,
    pub message: String,
    pub stack: Option<String>,
    pub proxy_note: Option<String>,
}

impl AppError {
    pub fn new(
        status: StatusCode,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            error_type: error_type.into(),
            message: message.into(),
            stack: None,
            proxy_note: None,
        }
    }

    pub fn proxy(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status, "proxy_error", message)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.proxy_note = Some(note.into());
        self
    }

    /// Payload of the non-streaming error envelope, also reused as the data
    /// field of streaming error frames.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.error_type,
            "message": self.message,
            "stack": self.stack,
            "proxy_note": self.proxy_note,
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy_note: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error_type: self.error_type,
            message: self.message,
            stack: self.stack,
            proxy_note: self.proxy_note,
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
