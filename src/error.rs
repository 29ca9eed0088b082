//! Error types for queue operations

use thiserror::Error;

/// Result alias used throughout the crate
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur during queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    /// Payload could not be serialized or deserialized
    #[error("Invalid payload: {0}")]
    Payload(String),

    /// Backend could not be reached or the connection was lost
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// No handler registered under the requested name
    #[error("No handler registered for job '{0}'")]
    HandlerNotFound(String),

    /// Connection name not present in the registry configuration
    #[error("Unknown connection '{0}'")]
    UnknownConnection(String),

    /// Connection configured with a driver no connector claims
    #[error("No connector registered for driver '{0}'")]
    UnknownDriver(String),

    /// Job exceeded its maximum number of attempts
    #[error("Job '{job}' has exceeded the maximum of {max_tries} attempts")]
    MaxAttemptsExceeded {
        /// Handler name of the exhausted job
        job: String,
        /// Effective attempt limit
        max_tries: u32,
    },

    /// Handler returned an error while processing a job
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl QueueError {
    /// Check whether this error looks like a lost backend connection.
    ///
    /// Workers use this to decide between retrying in place and exiting so a
    /// supervisor can restart them with a fresh connection.
    pub fn is_lost_connection(&self) -> bool {
        let QueueError::Unavailable(message) = self else {
            return false;
        };
        const MARKERS: &[&str] = &[
            "server has gone away",
            "no connection to the server",
            "lost connection",
            "is dead or not enabled",
            "error while sending",
            "server closed the connection unexpectedly",
            "broken pipe",
            "connection refused",
            "connection reset",
            "connection timed out",
            "decryption failed or bad record mac",
            "ssl connection has been closed unexpectedly",
        ];
        let lowered = message.to_lowercase();
        MARKERS.iter().any(|marker| lowered.contains(marker))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Payload(err.to_string())
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => QueueError::Payload(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                QueueError::Payload(err.to_string())
            }
            _ => QueueError::Unavailable(err.to_string()),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_connection_matches_known_phrases() {
        let err = QueueError::Unavailable("MySQL server has gone away".into());
        assert!(err.is_lost_connection());

        let err = QueueError::Unavailable("Broken pipe while writing".into());
        assert!(err.is_lost_connection());
    }

    #[test]
    fn lost_connection_ignores_other_errors() {
        assert!(!QueueError::Unavailable("syntax error near SELECT".into()).is_lost_connection());
        assert!(!QueueError::Payload("broken pipe".into()).is_lost_connection());
    }

    #[test]
    fn display_includes_context() {
        let err = QueueError::MaxAttemptsExceeded {
            job: "send_email".into(),
            max_tries: 3,
        };
        let display = format!("{}", err);
        assert!(display.contains("send_email"));
        assert!(display.contains('3'));
    }
}
