use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use event_buffer::BufferError;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

impl ResponseError for ServiceError {
    fn error_response(&self) -> HttpResponse {
        let code = self.status_code();
        let message = match self {
            ServiceError::NotFound(msg) | ServiceError::Validation(msg) => msg.clone(),
            _ => self.to_string(),
        };

        HttpResponse::build(code).json(ErrorResponse {
            error: message,
            code: code.as_u16(),
        })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Buffer(BufferError::UnsupportedLookup(_)) => StatusCode::NOT_IMPLEMENTED,
            ServiceError::Buffer(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Buffer(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
