use std::fmt;

use thiserror::Error;

/// Why a fetch against the market data API failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Network,
    RateLimited,
    Server,
    Auth,
    InvalidRequest,
    NotFound,
    Decode,
}

impl FetchErrorKind {
    pub const ALL: [FetchErrorKind; 7] = [
        Self::Network,
        Self::RateLimited,
        Self::Server,
        Self::Auth,
        Self::InvalidRequest,
        Self::NotFound,
        Self::Decode,
    ];

    /// Kinds a caller may reasonably retry without changing the request.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Network | Self::RateLimited | Self::Server | Self::Auth
        )
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::RateLimited => "rate limited",
            Self::Server => "server",
            Self::Auth => "auth",
            Self::InvalidRequest => "invalid request",
            Self::NotFound => "not found",
            Self::Decode => "decode",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind} error: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() || e.is_connect() || e.is_request() {
            FetchErrorKind::Network
        } else if e.is_decode() {
            FetchErrorKind::Decode
        } else {
            FetchErrorKind::Server
        };
        Self::new(kind, e.to_string())
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("schema mismatch on {target}: expected [{}], found [{}]", .expected.join(", "), .found.join(", "))]
    SchemaMismatch {
        target: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("cannot reach {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("write to {target} failed: {source}")]
    Persistence {
        target: String,
        #[source]
        source: BoxError,
    },
}

impl SinkError {
    pub fn connection(target: &str, source: impl Into<BoxError>) -> Self {
        Self::Connection {
            target: target.to_string(),
            source: source.into(),
        }
    }

    pub fn persistence(target: &str, source: impl Into<BoxError>) -> Self {
        Self::Persistence {
            target: target.to_string(),
            source: source.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("{series} [{range}]: gave up after {attempts} attempt(s): {source}")]
    TransientFetch {
        series: String,
        range: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    #[error("{series} [{range}]: {source}")]
    PermanentFetch {
        series: String,
        range: String,
        #[source]
        source: FetchError,
    },

    #[error("{series}: bar at {timestamp} does not follow {previous}")]
    OutOfOrder {
        series: String,
        previous: chrono::NaiveDateTime,
        timestamp: chrono::NaiveDateTime,
    },

    #[error("{series} [{range}]: {source}")]
    Sink {
        series: String,
        range: String,
        #[source]
        source: SinkError,
    },
}

impl AppError {
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(
            self,
            Self::Sink {
                source: SinkError::SchemaMismatch { .. },
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(FetchErrorKind::Network.is_transient());
        assert!(FetchErrorKind::RateLimited.is_transient());
        assert!(FetchErrorKind::Server.is_transient());
        assert!(FetchErrorKind::Auth.is_transient());
        assert!(!FetchErrorKind::InvalidRequest.is_transient());
        assert!(!FetchErrorKind::NotFound.is_transient());
        assert!(!FetchErrorKind::Decode.is_transient());
    }

    #[test]
    fn schema_mismatch_message_lists_columns() {
        let err = SinkError::SchemaMismatch {
            target: "nifty_5m".to_string(),
            expected: vec!["date".to_string(), "open".to_string()],
            found: vec!["ts".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "schema mismatch on nifty_5m: expected [date, open], found [ts]"
        );
    }
}
