//! Error types for the FlavorCraft loader

use thiserror::Error;

/// Maximum length of an error summary written for a failed batch.
pub const ERROR_SUMMARY_MAX_CHARS: usize = 100;

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Main error type for the loader
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv_async::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Header mismatch for {table}: expected [{expected}], found [{found}]")]
    HeaderMismatch {
        table: String,
        expected: String,
        found: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Shorten an error message to at most [`ERROR_SUMMARY_MAX_CHARS`] characters.
///
/// Cuts on a char boundary, so multi-byte messages from the server stay valid.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(ERROR_SUMMARY_MAX_CHARS) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_message_untouched() {
        assert_eq!(truncate_error("duplicate key"), "duplicate key");
    }

    #[test]
    fn test_truncate_long_message() {
        let long = "x".repeat(250);
        assert_eq!(truncate_error(&long).chars().count(), ERROR_SUMMARY_MAX_CHARS);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(150);
        let cut = truncate_error(&long);
        assert_eq!(cut.chars().count(), 100);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_header_mismatch_display() {
        let err = LoadError::HeaderMismatch {
            table: "dim_users".to_string(),
            expected: "id, name".to_string(),
            found: "id".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Header mismatch for dim_users: expected [id, name], found [id]"
        );
    }

    #[test]
    fn test_source_errors_convert() {
        let io: LoadError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(io, LoadError::Io(_)));

        let json: LoadError = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert!(matches!(json, LoadError::Serialization(_)));
        assert!(json.to_string().starts_with("Serialization error:"));
    }
}
