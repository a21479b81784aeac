// =============================================================================
// Orbiton Matrix Homeserver Core - Error Types
// =============================================================================
//
// Project: Orbiton - Federated Matrix Homeserver Core
// Contributors: Orbiton Development Team
// License: Apache 2.0 / MIT
//
// Description:
//   Crate-wide error taxonomy: local absence, malformed input, authorization
//   and verification failures, federation timeouts, latched peers, cached-only
//   read misses, store corruption and internal invariant violations. Each
//   variant carries its propagation policy through the HTTP response mapping.
//
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ruma::api::client::error::ErrorKind;
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Bad configuration: {0}")]
    BadConfig(&'static str),

    #[error("Database error: {0}")]
    BadDatabase(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON on the wire or in the store.
    #[error("Bad JSON: {0}")]
    BadJson(String),

    /// Structurally valid JSON that does not conform to the room version.
    #[error("Event does not conform: {0}")]
    Conforms(&'static str),

    /// Rejected by the authorization rule pipeline. `rule` names the rule
    /// that failed, `reason` is the human-readable explanation.
    #[error("Authorization failed ({rule}): {reason}")]
    AuthFail { rule: &'static str, reason: String },

    /// Content hash or signature mismatch. Permanent reject.
    #[error("Verification failed: {0}")]
    VerifyFail(String),

    #[error("Not found: {0}")]
    NotFound(&'static str),

    /// An event with this event_id already exists and `replays` is off.
    #[error("Not unique: {0}")]
    NotUnique(&'static str),

    /// Deadline exceeded on a fetch or fan-out member. Per-attempt.
    #[error("Timeout: {0}")]
    Timeout(&'static str),

    /// Peer is latched in error and skipped until cleared by an operator.
    #[error("Peer unavailable: {0}")]
    Unavailable(String),

    /// Cached-only read miss; the caller decides whether to block instead.
    #[error("Incomplete: value not cached")]
    Incomplete,

    /// Detected store-level inconsistency. Never self-heals; `repairable`
    /// marks whether a bulk index rebuild can regenerate the damage.
    #[error("Store corruption ({}): {detail}", if *.repairable { "repairable" } else { "fatal" })]
    Corruption { repairable: bool, detail: String },

    /// Invariant violation inside this process.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {1}")]
    BadRequest(ErrorKind, &'static str),

    #[error("Bad request: {1}")]
    BadRequestString(ErrorKind, String),

    #[error("Bad response from {0}: {1}")]
    BadServerResponse(ruma::OwnedServerName, &'static str),

    #[error("Federation is disabled")]
    FederationDisabled,
}

impl Error {
    pub fn bad_database(message: &'static str) -> Self {
        error!("Bad database: {}", message);
        Self::BadDatabase(message)
    }

    pub fn bad_config(message: &'static str) -> Self {
        error!("Bad config: {}", message);
        Self::BadConfig(message)
    }

    pub fn bad_json<E: std::fmt::Display>(e: E) -> Self {
        Self::BadJson(e.to_string())
    }

    /// The `errcode` this error maps to on the federation wire.
    pub fn errcode(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "M_NOT_FOUND",
            Self::BadJson(_) | Self::Conforms(_) => "M_BAD_JSON",
            Self::AuthFail { .. } | Self::VerifyFail(_) | Self::FederationDisabled => {
                "M_FORBIDDEN"
            }
            Self::Timeout(_) => "M_LIMIT_EXCEEDED",
            Self::BadRequest(kind, _) | Self::BadRequestString(kind, _) => match kind {
                ErrorKind::NotFound => "M_NOT_FOUND",
                ErrorKind::InvalidParam => "M_INVALID_PARAM",
                ErrorKind::NotJson => "M_NOT_JSON",
                ErrorKind::MissingToken => "M_MISSING_TOKEN",
                ErrorKind::UnknownToken { .. } => "M_UNKNOWN_TOKEN",
                ErrorKind::TooLarge => "M_TOO_LARGE",
                _ => "M_FORBIDDEN",
            },
            _ => "M_UNKNOWN",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadJson(_) | Self::Conforms(_) => StatusCode::BAD_REQUEST,
            Self::AuthFail { .. } | Self::VerifyFail(_) | Self::FederationDisabled => {
                StatusCode::FORBIDDEN
            }
            Self::NotUnique(_) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Unavailable(_) => StatusCode::BAD_GATEWAY,
            Self::BadRequest(kind, _) | Self::BadRequestString(kind, _) => match kind {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::MissingToken | ErrorKind::UnknownToken { .. } => {
                    StatusCode::UNAUTHORIZED
                }
                ErrorKind::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Responding with internal error: {}", self);
        }

        let body = json!({
            "errcode": self.errcode(),
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: Error variants carry their taxonomy through display and errcode
    #[test]
    fn test_error_taxonomy_mapping() {
        let e = Error::NotFound("event");
        assert_eq!(e.errcode(), "M_NOT_FOUND");
        assert_eq!(e.status_code(), StatusCode::NOT_FOUND);

        let e = Error::AuthFail {
            rule: "rule_6",
            reason: "sender is not joined to room".to_owned(),
        };
        assert_eq!(e.errcode(), "M_FORBIDDEN");
        assert!(e.to_string().contains("rule_6"));
        assert!(e.to_string().contains("not joined"));

        let e = Error::VerifyFail("content hash mismatch".to_owned());
        assert_eq!(e.status_code(), StatusCode::FORBIDDEN);

        let e = Error::Timeout("backfill");
        assert_eq!(e.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    /// Test: Cached-only read misses and corruption stay server-side errors
    #[test]
    fn test_internal_variants() {
        assert_eq!(
            Error::Incomplete.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let corruption = Error::Corruption {
            repairable: true,
            detail: "sender_eventidx row missing for idx 17".to_owned(),
        };
        assert!(corruption.to_string().contains("repairable"));
        assert_eq!(corruption.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
