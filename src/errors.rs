//! Centralised error type for the indexer, the server and the transport.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid setting `{0}`: {1}")]
    InvalidSetting(&'static str, String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("Schema mismatch on field `{field}`: expected {expected}, got {got}")]
    SchemaMismatch {
        field: String,
        expected: &'static str,
        got: String,
    },

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Unknown field `{0}`")]
    UnknownField(String),

    #[error("Invalid filter on `{0}`: {1}")]
    InvalidFilter(String, String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("Malformed request body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Snapshot JSON error: {0}")]
    SnapshotJson(#[source] serde_json::Error),

    #[error("Unsupported snapshot version {0}")]
    SnapshotVersion(u32),

    #[error("Snapshot encode error: {0}")]
    SnapshotEncode(#[from] rmp_serde::encode::Error),

    #[error("Snapshot decode error: {0}")]
    SnapshotDecode(#[from] rmp_serde::decode::Error),

    #[error("HTTP server error: {0}")]
    Server(#[from] hyper::Error),

    #[error("HTTP error posting to {0}: {1}")]
    Http(String, #[source] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("Invalid URL {0}: {1}")]
    Url(String, #[source] url::ParseError),

    #[error("Transport is closed")]
    TransportClosed,

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IndexerError {
    /// True when the failure was caused by the caller's input rather than by
    /// the server itself. The HTTP layer maps these to `400 Bad Request`.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            IndexerError::SchemaMismatch { .. }
                | IndexerError::UnknownField(_)
                | IndexerError::InvalidFilter(..)
                | IndexerError::InvalidDocument(_)
                | IndexerError::BodyTooLarge(_)
                | IndexerError::Json(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_classified() {
        assert!(IndexerError::UnknownField("nope".into()).is_client_error());
        assert!(IndexerError::InvalidDocument("not an object".into()).is_client_error());
        assert!(IndexerError::BodyTooLarge(1024).is_client_error());
        assert!(!IndexerError::InvalidSchema("empty".into()).is_client_error());
        assert!(!IndexerError::Io(std::io::Error::other("disk")).is_client_error());
    }

    #[test]
    fn schema_mismatch_message_names_the_field() {
        let err = IndexerError::SchemaMismatch {
            field: "level".into(),
            expected: "number",
            got: "string".into(),
        };
        assert_eq!(
            err.to_string(),
            "Schema mismatch on field `level`: expected number, got string"
        );
    }
}
