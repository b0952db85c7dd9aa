use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(String),
}

impl CacheError {
    pub fn store(message: impl Into<String>) -> Self {
        CacheError::Store(message.into())
    }
}

impl ResponseError for CacheError {
    fn status_code(&self) -> StatusCode {
        match self {
            CacheError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        let error_message = self.to_string();

        log::error!(
            "Request failed with status {}: {}",
            status_code,
            error_message
        );

        HttpResponse::build(status_code).json(serde_json::json!({
            "success": false,
            "error": error_message,
        }))
    }
}
