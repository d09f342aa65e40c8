use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::cache::AdminError;

/// Error chain handed from an admin handler to the request log.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub source: &'static str,
    pub chain: Vec<String>,
}

impl FailureReport {
    fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let chain = std::iter::successors(Some(error), |&err| err.source())
            .map(ToString::to_string)
            .collect();
        Self { source, chain }
    }

    pub fn detail(&self) -> &str {
        self.chain.first().map_or("no diagnostic available", String::as_str)
    }
}

/// JSON error answer of the admin listener.
///
/// The body carries a fixed message, plus the first diagnostic when the
/// operator can act on it (a rejected setting, a missing cache directory).
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: &'static str,
    public_detail: bool,
    report: FailureReport,
}

impl HttpError {
    /// A request the handler refused; the detail is always shown.
    pub fn rejected(
        source: &'static str,
        status: StatusCode,
        message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            status,
            message,
            public_detail: true,
            report: FailureReport {
                source,
                chain: vec![detail.into()],
            },
        }
    }

    /// Maps a failed cache administration call.
    pub fn from_admin(source: &'static str, err: &AdminError) -> Self {
        let (status, message, public_detail) = match err {
            AdminError::Validation { .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Invalid page cache settings",
                true,
            ),
            AdminError::Initialization(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Page cache could not be initialized",
                true,
            ),
            AdminError::Cache(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Page cache operation failed",
                false,
            ),
        };
        Self {
            status,
            message,
            public_detail,
            report: FailureReport::from_error(source, err),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = if self.public_detail {
            json!({ "error": self.message, "detail": self.report.detail() })
        } else {
            json!({ "error": self.message })
        };
        let mut response = (self.status, Json(body)).into_response();
        response.extensions_mut().insert(self.report);
        response
    }
}
