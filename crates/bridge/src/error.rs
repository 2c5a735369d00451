//! Error taxonomy shared by the control and telemetry paths.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed or out-of-domain client request. State is never touched.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The durable medium (control document or telemetry database) could
    /// not be read or written.
    #[error("storage unavailable: {context}: {source}")]
    StorageUnavailable {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The MQTT link dropped. Always retried.
    #[error("transport disconnected: {0}")]
    TransportDisconnected(String),

    /// A single telemetry payload could not be interpreted.
    #[error("unparsable telemetry payload: {0}")]
    ParseFailure(String),
}

impl BridgeError {
    pub fn storage(
        context: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::StorageUnavailable {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable { .. } | Self::TransportDisconnected(_)
        )
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        Self::storage("database", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_retryable() {
        let err = BridgeError::storage("write", std::io::Error::other("disk gone"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn input_and_parse_errors_are_not_retryable() {
        assert!(!BridgeError::InvalidInput("x".into()).is_retryable());
        assert!(!BridgeError::ParseFailure("x".into()).is_retryable());
    }

    #[test]
    fn sqlx_errors_map_to_storage_unavailable() {
        let err: BridgeError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, BridgeError::StorageUnavailable { .. }));
    }
}
