use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

/// The machine-readable error taxonomy exposed at the HTTP/WS boundary. Everything below
/// this boundary (ingest, store, candles, aggregation) keeps using `anyhow::Result`; this
/// type exists only because callers need a stable `code` string, which a bare
/// `anyhow::Error` can't carry.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    PriceUnavailable(String),
    InvalidRequest(String),
    RateLimited { retry_after_secs: u64 },
    UpstreamUnavailable(String),
    Internal(anyhow::Error),
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "SYMBOL_NOT_FOUND",
            AppError::PriceUnavailable(_) => "PRICE_NOT_AVAILABLE",
            AppError::InvalidRequest(_) => "INVALID_LIMIT_RANGE",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) | AppError::PriceUnavailable(_) => StatusCode::NOT_FOUND,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::NotFound(m)
            | AppError::PriceUnavailable(m)
            | AppError::InvalidRequest(m)
            | AppError::UpstreamUnavailable(m) => m.clone(),
            AppError::RateLimited { retry_after_secs } => {
                format!("rate limit exceeded, retry after {retry_after_secs}s")
            }
            AppError::Internal(e) => e.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: status.canonical_reason().unwrap_or("error").to_string(),
            message: self.message(),
            code: self.code().to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        if let AppError::RateLimited { retry_after_secs } = &self {
            response.headers_mut().insert(
                "Retry-After",
                retry_after_secs.to_string().parse().unwrap(),
            );
        }
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(e)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(e.into())
    }
}

impl From<crate::candles::BackfillError> for AppError {
    fn from(e: crate::candles::BackfillError) -> Self {
        match e {
            crate::candles::BackfillError::RateLimited { retry_after_secs } => {
                AppError::RateLimited { retry_after_secs }
            }
            crate::candles::BackfillError::Other(err) => AppError::Internal(err),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_unavailable_maps_to_not_found_with_distinct_code() {
        let err = AppError::PriceUnavailable("no ticks yet".to_string());
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "PRICE_NOT_AVAILABLE");
    }

    #[test]
    fn rate_limited_maps_to_429() {
        let err = AppError::RateLimited { retry_after_secs: 5 };
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code(), "RATE_LIMITED");
    }
}
