//! Error types for shipgate-state

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// Underlying filesystem failure
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A persisted document could not be (de)serialized
    #[error("serialization failed for {path}: {detail}")]
    Serialization { path: String, detail: String },

    /// A digest string is not 64 lowercase hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// The (name, version) pair has already been published
    #[error("{name} {version} has already been published")]
    AlreadyPublished { name: String, version: String },

    /// A stored record is missing
    #[error("record not found: {0}")]
    NotFound(String),
}

impl StateError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub(crate) fn serde(path: impl AsRef<std::path::Path>, err: serde_json::Error) -> Self {
        StateError::Serialization {
            path: path.as_ref().display().to_string(),
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_published_names_pair() {
        let err = StateError::AlreadyPublished {
            name: "vault".to_string(),
            version: "1.2.3".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("vault"));
        assert!(msg.contains("1.2.3"));
    }

    #[test]
    fn io_error_carries_path() {
        let err = StateError::io(
            "/tmp/missing",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/missing"));
    }
}
