use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Failure classes shared by every stage of the pipeline. Reports carry the
/// kind next to the failing identifier so a re-run can be targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    Auth,
    NotFound,
    Conflict,
    Io,
    RateLimited,
    Protocol,
    Config,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Io => "io",
            Self::RateLimited => "rate_limited",
            Self::Protocol => "protocol",
            Self::Config => "config",
        }
    }

    /// Run-level kinds abort the pipeline instead of being recorded per item.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Auth | Self::Config)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientNetwork | Self::RateLimited)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum WikiError {
    #[error("page not found: {0}")]
    NotFound(String),
    #[error("wiki requires authentication: {0}")]
    AuthRequired(String),
    #[error("wiki rate limit hit: {0}")]
    RateLimited(String),
    #[error("wiki request failed: {0}")]
    Transient(String),
    #[error("unexpected wiki response: {0}")]
    Protocol(String),
    #[error("invalid wiki configuration: {0}")]
    Config(String),
}

impl WikiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AuthRequired(_) => ErrorKind::Auth,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Transient(_) => ErrorKind::TransientNetwork,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExportError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Io
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("target platform rejected credentials: {0}")]
    Auth(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("target platform server error: {0}")]
    Server(String),
    #[error("target platform rate limit hit: {0}")]
    RateLimited(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unexpected target platform response: {0}")]
    Protocol(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid target configuration: {0}")]
    Config(String),
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Server(_) => ErrorKind::TransientNetwork,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Io { .. } => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, UploadError, WikiError};

    #[test]
    fn only_auth_and_config_are_fatal() {
        assert!(ErrorKind::Auth.is_fatal());
        assert!(ErrorKind::Config.is_fatal());
        assert!(!ErrorKind::NotFound.is_fatal());
        assert!(!ErrorKind::RateLimited.is_fatal());
        assert!(!ErrorKind::Io.is_fatal());
    }

    #[test]
    fn server_errors_map_to_transient_kind() {
        let error = UploadError::Server("HTTP 502".to_string());
        assert_eq!(error.kind(), ErrorKind::TransientNetwork);
        assert!(error.kind().is_retryable());
        assert_eq!(
            WikiError::RateLimited("slow down".to_string()).kind(),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn kind_serializes_as_snake_case() {
        let rendered = serde_json::to_string(&ErrorKind::TransientNetwork).expect("serialize");
        assert_eq!(rendered, "\"transient_network\"");
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }
}
