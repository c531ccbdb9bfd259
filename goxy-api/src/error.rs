//! Maps `goxy_core::error::CoreError` onto HTTP status codes and a small
//! JSON error envelope, the way the proxy's old `DatabaseError` mapped
//! SQLite failures onto response bodies.

use actix_web::{HttpResponse, ResponseError};
use goxy_core::error::CoreError;
use serde::Serialize;
use std::fmt;

#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let body = ErrorBody {
            status: "error",
            message: self.0.to_string(),
        };
        match &self.0 {
            CoreError::NoSuchProxy(_) | CoreError::InvalidFilter { .. } => {
                HttpResponse::BadRequest().json(body)
            }
            CoreError::InvalidConfig(_) | CoreError::MalformedVerdict(_) | CoreError::UnknownRule(_) => {
                HttpResponse::BadRequest().json(body)
            }
            _ => HttpResponse::InternalServerError().json(body),
        }
    }
}
