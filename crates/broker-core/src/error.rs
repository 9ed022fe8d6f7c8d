#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("no accounts available")]
    NoCandidate,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrokerError::BadRequest("purpose is required".to_string());
        assert_eq!(err.to_string(), "invalid request: purpose is required");

        let err = BrokerError::NoCandidate;
        assert_eq!(err.to_string(), "no accounts available");
    }

    #[test]
    fn test_from_sqlx_error() {
        let err: BrokerError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BrokerError::Database(_)));
    }
}
