//! Error types for chorus-wire

use thiserror::Error;

/// Result type alias using chorus-wire Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding or building wire values
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame was structurally unusable
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl Error {
    /// Create an invalid-frame error
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame(reason.into())
    }

    /// Whether this error came from malformed JSON text
    pub fn is_syntax(&self) -> bool {
        match self {
            Error::Json(e) => e.is_syntax() || e.is_eof(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_detected() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(err.is_syntax());
    }

    #[test]
    fn test_invalid_frame_not_syntax() {
        let err = Error::invalid_frame("missing type");
        assert!(!err.is_syntax());
        assert_eq!(err.to_string(), "Invalid frame: missing type");
    }
}
