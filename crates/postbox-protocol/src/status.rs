//! Status codes reported to transports.
//!
//! Codes follow their HTTP equivalents so a transport can pass them through
//! unchanged. Detailed errors are logged, not reported.

use serde::{Deserialize, Serialize};

/// Transport status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum StatusCode {
    /// Success.
    Ok = 200,

    // === 4xx: Client errors ===
    /// Malformed request (bad encoding, invalid key, unknown algorithm).
    BadRequest = 400,
    /// Sender is not allowed to push to this postbox.
    Forbidden = 403,
    /// Postbox or message not found.
    NotFound = 404,
    /// Message can no longer be changed.
    Conflict = 409,
    /// Webreference does not exist (any more).
    Gone = 410,
    /// Payload or quota limit exceeded.
    PayloadTooLarge = 413,
    /// Key list rejected.
    UnprocessableEntity = 422,

    // === 5xx: Server errors ===
    /// Internal error (details not disclosed).
    InternalError = 500,
    /// Reference type not served.
    NotImplemented = 501,
    /// Remote source unavailable.
    BadGateway = 502,
}

impl StatusCode {
    /// Check if this is a success code.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Check if this is a client error (4xx range).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code())
    }

    /// Check if this is a server error (5xx range).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code())
    }

    /// Get the numeric code.
    #[must_use]
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Get a generic description (safe to send to clients).
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::BadRequest => "bad request",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Gone => "gone",
            Self::PayloadTooLarge => "payload too large",
            Self::UnprocessableEntity => "unprocessable entity",
            Self::InternalError => "internal error",
            Self::NotImplemented => "not implemented",
            Self::BadGateway => "bad gateway",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}
