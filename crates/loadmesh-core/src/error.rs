use serde::{Deserialize, Serialize};

/// Error taxonomy from the coordination-fabric error design: these are
/// *kinds*, not exhaustive types — several [`Error`] variants collapse onto
/// the same kind (e.g. every transport failure is `Connection`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Parsing,
    Validation,
    Execution,
    Timeout,
    Connection,
    Authentication,
    ResourceExhausted,
    NotFound,
    Conflict,
    Cancelled,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Parsing => "parsing",
            ErrorKind::Validation => "validation",
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::ResourceExhausted => "resource-exhausted",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parsing error: {0}")]
    Parsing(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Classify this error into one of the ten taxonomy kinds from the
    /// error-handling design. Transport wrapper variants (`Http`, `Io`,
    /// `WebSocket`) all collapse onto `Connection` since that is the kind a
    /// caller needs to decide whether to reconnect.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Parsing(_) | Error::Serde(_) | Error::Yaml(_) => ErrorKind::Parsing,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Execution(_) => ErrorKind::Execution,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Connection(_) | Error::Http(_) | Error::Io(_) | Error::WebSocket(_) => {
                ErrorKind::Connection
            }
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Build the `{error, message}` shape every REST response carries.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// User-visible failure shape carried by every REST response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_response().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = Error::Validation("field X is required".to_string());
        assert_eq!(err.to_string(), "validation error: field X is required");
    }

    #[test]
    fn kind_mapping_for_taxonomy_variants() {
        assert_eq!(Error::Parsing("x".into()).kind(), ErrorKind::Parsing);
        assert_eq!(Error::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(Error::Execution("x".into()).kind(), ErrorKind::Execution);
        assert_eq!(Error::Timeout("x".into()).kind(), ErrorKind::Timeout);
        assert_eq!(Error::Connection("x".into()).kind(), ErrorKind::Connection);
        assert_eq!(
            Error::Authentication("x".into()).kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            Error::ResourceExhausted("x".into()).kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(Error::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(Error::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(Error::Cancelled("x".into()).kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn transport_errors_classify_as_connection() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn serde_error_classifies_as_parsing() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: Error = json_err.into();
        assert_eq!(err.kind(), ErrorKind::Parsing);
        assert!(err.to_string().contains("serialization error"));
    }

    #[test]
    fn code_strings_match_taxonomy_spelling() {
        assert_eq!(ErrorKind::ResourceExhausted.code(), "resource-exhausted");
        assert_eq!(ErrorKind::NotFound.code(), "not-found");
        assert_eq!(ErrorKind::Cancelled.code(), "cancelled");
    }

    #[test]
    fn to_response_carries_code_and_message() {
        let err = Error::NotFound("execution abc-123".to_string());
        let resp = err.to_response();
        assert_eq!(resp.error, "not-found");
        assert_eq!(resp.message, "not found: execution abc-123");
    }

    #[test]
    fn serialize_produces_error_response_shape() {
        let err = Error::Validation("test error".to_string());
        let json = serde_json::to_value(&err).expect("serialize should succeed");
        assert_eq!(json["error"], "validation");
        assert_eq!(json["message"], "validation error: test error");
    }

    #[test]
    fn error_is_debug() {
        let err = Error::Validation("test".to_string());
        let debug = format!("{:?}", err);
        assert!(debug.contains("Validation"));
    }
}
