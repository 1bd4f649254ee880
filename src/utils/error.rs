//! Error types for the ingestion pipeline.
//!
//! Every failure is classified into one [`ErrorKind`]. The retry policy only
//! ever absorbs [`ErrorKind::Transient`]; everything else reaches the
//! ingestion loop unchanged.

use std::fmt;
use thiserror::Error;

/// Coarse classification used for retry decisions and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network, timeout, remote temporarily unavailable.
    Transient,
    /// Unexpected or incompatible data shape from the portal.
    Protocol,
    /// The store rejected a write (constraint or schema mismatch).
    Data,
    /// Invalid or missing configuration.
    Config,
    /// Cancellation was observed before the operation completed.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Data => "data",
            ErrorKind::Config => "config",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, IndexerError>;

impl IndexerError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexerError::Transient(_) => ErrorKind::Transient,
            IndexerError::Protocol(_) => ErrorKind::Protocol,
            IndexerError::Data(_) => ErrorKind::Data,
            IndexerError::Config(_) => ErrorKind::Config,
            IndexerError::Cancelled => ErrorKind::Cancelled,
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<reqwest::Error> for IndexerError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return classify_status(status.as_u16(), &err.to_string());
        }
        if err.is_builder() {
            return IndexerError::Config(err.to_string());
        }
        // connect, timeout, request and body failures all come back on retry
        IndexerError::Transient(err.to_string())
    }
}

/// Maps an HTTP status returned by the portal onto an error kind.
pub fn classify_status(status: u16, message: &str) -> IndexerError {
    match status {
        408 | 429 | 500..=599 => IndexerError::Transient(format!("HTTP {status}: {message}")),
        _ => IndexerError::Protocol(format!("HTTP {status}: {message}")),
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() {
            IndexerError::Protocol(format!("unexpected portal payload: {err}"))
        } else {
            // syntax, eof and io errors come from truncated or corrupted bodies
            IndexerError::Transient(format!("malformed portal payload: {err}"))
        }
    }
}

/// ClickHouse server codes that resolve on their own.
///
/// 159 TIMEOUT_EXCEEDED, 202 TOO_MANY_SIMULTANEOUS_QUERIES, 209 SOCKET_TIMEOUT,
/// 210 NETWORK_ERROR, 241 MEMORY_LIMIT_EXCEEDED, 242 TABLE_IS_READ_ONLY,
/// 252 TOO_MANY_PARTS, 425 SYSTEM_ERROR.
const TRANSIENT_CLICKHOUSE_CODES: &[u32] = &[159, 202, 209, 210, 241, 242, 252, 425];

fn clickhouse_code(message: &str) -> Option<u32> {
    let rest = &message[message.find("Code: ")? + "Code: ".len()..];
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

impl From<clickhouse::error::Error> for IndexerError {
    fn from(err: clickhouse::error::Error) -> Self {
        use clickhouse::error::Error as Ch;

        match &err {
            Ch::Network(_) | Ch::TimedOut => IndexerError::Transient(err.to_string()),
            Ch::BadResponse(message) => match clickhouse_code(message) {
                Some(code) if TRANSIENT_CLICKHOUSE_CODES.contains(&code) => {
                    IndexerError::Transient(err.to_string())
                }
                _ => IndexerError::Data(err.to_string()),
            },
            _ => IndexerError::Data(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for IndexerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => IndexerError::Transient(err.to_string()),
            sqlx::Error::Configuration(_) => IndexerError::Config(err.to_string()),
            _ => IndexerError::Data(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(503, "unavailable").is_transient());
        assert!(classify_status(429, "slow down").is_transient());
        assert!(classify_status(408, "timeout").is_transient());
        assert_eq!(classify_status(400, "bad query").kind(), ErrorKind::Protocol);
        assert_eq!(classify_status(404, "no dataset").kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_json_schema_mismatch_is_protocol() {
        let err = serde_json::from_str::<u64>("\"not a number\"").unwrap_err();
        assert_eq!(IndexerError::from(err).kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_truncated_json_is_transient() {
        let err = serde_json::from_str::<serde_json::Value>("{\"header\": {").unwrap_err();
        assert!(IndexerError::from(err).is_transient());
    }

    #[test]
    fn test_clickhouse_code_parsing() {
        let msg = "Code: 252. DB::Exception: Too many parts (300).";
        assert_eq!(clickhouse_code(msg), Some(252));
        assert_eq!(clickhouse_code("no code here"), None);
    }

    #[test]
    fn test_clickhouse_classification() {
        let overload = clickhouse::error::Error::BadResponse(
            "Code: 202. DB::Exception: Too many simultaneous queries".to_string(),
        );
        assert!(IndexerError::from(overload).is_transient());

        let schema = clickhouse::error::Error::BadResponse(
            "Code: 16. DB::Exception: No such column foo".to_string(),
        );
        assert_eq!(IndexerError::from(schema).kind(), ErrorKind::Data);

        assert!(IndexerError::from(clickhouse::error::Error::TimedOut).is_transient());
    }
}
