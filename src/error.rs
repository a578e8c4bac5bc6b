use thiserror::Error;

/// A single error item from a JSON:API error response body.
///
/// The remote API reports request failures as `{"errors": [...]}` where each
/// item may carry a `source.pointer` locating the offending attribute. The
/// pointer is what distinguishes a snapshot-level rejection from a
/// build-level one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiErrorDetail {
    pub source_pointer: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The distinguished rejection produced by task cancellation.
    #[error("task canceled")]
    Canceled,

    #[error("build error: {0}")]
    Build(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("upload error: {0}")]
    Upload(String),

    /// A structured API failure with the parsed JSON:API error items.
    #[error("API request failed{}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Api {
        status: Option<u16>,
        errors: Vec<ApiErrorDetail>,
    },

    /// Configuration problems are warnings, never fatal to a run.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("port {0} is already in use; is another instance running?")]
    AddrInUse(u16),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => *status,
            _ => None,
        }
    }

    /// The `source.pointer` of the first API error item carrying one.
    pub fn error_pointer(&self) -> Option<&str> {
        match self {
            Error::Api { errors, .. } => errors
                .iter()
                .find_map(|e| e.source_pointer.as_deref()),
            _ => None,
        }
    }

    /// The `detail` of the first API error item carrying one.
    pub fn error_detail(&self) -> Option<&str> {
        match self {
            Error::Api { errors, .. } => errors.iter().find_map(|e| e.detail.as_deref()),
            _ => None,
        }
    }

    /// Whether any API error item points at the given JSON:API source.
    ///
    /// The error body may carry several items in any order; matching must
    /// not depend on the position of the interesting one.
    pub fn has_error_pointer(&self, pointer: &str) -> bool {
        match self {
            Error::Api { errors, .. } => errors
                .iter()
                .any(|e| e.source_pointer.as_deref() == Some(pointer)),
            _ => false,
        }
    }

    /// The `detail` of the first API error item whose pointer matches.
    pub fn detail_for_pointer(&self, pointer: &str) -> Option<&str> {
        match self {
            Error::Api { errors, .. } => errors
                .iter()
                .find(|e| e.source_pointer.as_deref() == Some(pointer))
                .and_then(|e| e.detail.as_deref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canceled_is_distinguished() {
        assert!(Error::Canceled.is_canceled());
        assert!(!Error::Build("boom".into()).is_canceled());
    }

    #[test]
    fn api_error_accessors() {
        let err = Error::Api {
            status: Some(422),
            errors: vec![ApiErrorDetail {
                source_pointer: Some("/data/attributes/build".into()),
                detail: Some("build is finalized".into()),
            }],
        };
        assert_eq!(err.status_code(), Some(422));
        assert_eq!(err.error_pointer(), Some("/data/attributes/build"));
        assert_eq!(err.error_detail(), Some("build is finalized"));
        assert_eq!(Error::Canceled.status_code(), None);
    }

    #[test]
    fn pointer_matching_scans_every_item() {
        let err = Error::Api {
            status: Some(422),
            errors: vec![
                ApiErrorDetail {
                    source_pointer: None,
                    detail: Some("name is invalid".into()),
                },
                ApiErrorDetail {
                    source_pointer: Some("/data/attributes/name".into()),
                    detail: None,
                },
                ApiErrorDetail {
                    source_pointer: Some("/data/attributes/build".into()),
                    detail: Some("build is finalized".into()),
                },
            ],
        };
        assert!(err.has_error_pointer("/data/attributes/build"));
        assert!(!err.has_error_pointer("/data/attributes/widths"));
        assert_eq!(
            err.detail_for_pointer("/data/attributes/build"),
            Some("build is finalized")
        );
        assert_eq!(err.detail_for_pointer("/data/attributes/name"), None);
        assert!(!Error::Canceled.has_error_pointer("/data/attributes/build"));
    }
}
