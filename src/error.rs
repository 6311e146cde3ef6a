// =============================================================================
// Error taxonomy — tagged variants per boundary, not exceptions
// =============================================================================
//
// Each external boundary (exchange, LLM, decision parsing, portfolio
// mutation, storage) has its own `thiserror` enum. `anyhow::Result` is still
// used for plumbing inside adapter internals, the same split the teacher
// uses in `binance/client.rs` (anyhow `Context` on every fallible I/O step).
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the Exchange Adapter (C1).
#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    #[error("transient upstream error: {0}")]
    TransientUpstream(String),
    #[error("rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("permanent upstream error: {0}")]
    PermanentUpstream(String),
}

/// Errors surfaced by the LLM Client (C7).
#[derive(Debug, Error, Clone)]
pub enum LlmError {
    #[error("llm call timed out")]
    Timeout,
    #[error("llm request failed: {0}")]
    RequestFailed(String),
}

/// Errors surfaced while parsing a structured decision out of LLM output (C7/C8).
#[derive(Debug, Error, Clone)]
#[error("failed to parse decision: {reason} (raw: {raw})")]
pub struct ParseError {
    pub reason: String,
    pub raw: String,
}

/// Errors surfaced while applying a decision to a model's portfolio (C5/C8).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("the matching auto-trading flag is disabled")]
    Disabled,
    #[error("quantity must be greater than zero")]
    BadQuantity,
    #[error("symbol {0} is not priced in the market cache")]
    UnknownSymbol(String),
    #[error("leverage {0} is outside the allowed range [1, 125]")]
    Overleveraged(u32),
    #[error("insufficient margin: need {needed:.8}, have {available:.8}")]
    InsufficientMargin { needed: f64, available: f64 },
    #[error("model already holds {0} open positions (limit reached)")]
    MaxPositionsReached(u32),
    #[error("no open position for {symbol} {side}")]
    NoSuchPosition { symbol: String, side: String },
}

/// Errors surfaced by the Store (C10).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no such model {0}")]
    NoSuchModel(String),
}

/// Returned by the Per-Model Scheduler (C9) when a cycle is already running.
#[derive(Debug, Error, Clone, Copy)]
#[error("a cycle is already running for this model")]
pub struct Busy;

/// Top-level application error returned from HTTP handlers.
///
/// HTTP 4xx for invalid input, 5xx only for `StoreError`/internal panics;
/// every other operational failure is HTTP 200 with `{success:false,error}`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("busy")]
    Busy,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body_is_4xx) = match &self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, true),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, true),
            AppError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, false),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, false),
            AppError::Exchange(_) | AppError::Apply(_) | AppError::Busy => (StatusCode::OK, false),
        };

        let status = if body_is_4xx { status } else { status };
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_error_messages_are_stable() {
        assert_eq!(
            ApplyError::Overleveraged(200).to_string(),
            "leverage 200 is outside the allowed range [1, 125]"
        );
        assert_eq!(
            ApplyError::MaxPositionsReached(5).to_string(),
            "model already holds 5 open positions (limit reached)"
        );
    }

    #[test]
    fn app_error_from_apply_error_is_http_200() {
        let err: AppError = ApplyError::BadQuantity.into();
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn app_error_not_found_is_http_404() {
        let err = AppError::NotFound("model abc".into());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
