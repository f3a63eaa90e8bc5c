use thiserror::Error;

/// Everything that can go wrong between a key press and a persisted round.
#[derive(Error, Debug)]
pub enum Error {
    /// The request could not be sent or its response could not be read
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx status, or a 2xx body that does not match the contract
    #[error("backend error{}: {message}", status_suffix(.status))]
    Backend {
        status: Option<u16>,
        message: String,
    },

    /// Required prior state is missing (e.g. images requested before variants)
    #[error("validation error: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn backend(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Backend {
            status,
            message: message.into(),
        }
    }

    /// True for failures that came back from (or never reached) the backend.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Backend { .. })
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_display_includes_status() {
        let err = Error::backend(Some(500), "boom");
        assert_eq!(err.to_string(), "backend error (500): boom");
    }

    #[test]
    fn backend_error_display_without_status() {
        let err = Error::backend(None, "missing field `variants`");
        assert_eq!(err.to_string(), "backend error: missing field `variants`");
    }

    #[test]
    fn remote_classification() {
        assert!(Error::Network("refused".into()).is_remote());
        assert!(Error::backend(Some(404), "nope").is_remote());
        assert!(!Error::Validation("no variants".into()).is_remote());
    }
}
