//! Error type shared by the harvesting modules.
//!
//! `main` still returns `Box<dyn Error>`; everything below it speaks
//! [`HarvestError`] so the paginator can tell a throttled session apart from a
//! broken one.

use thiserror::Error;

/// Errors produced while loading configuration, talking to the endpoint or
/// persisting progress.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint signalled throttling for the current credential.
    #[error("rate limited (status {status})")]
    RateLimited { status: u16 },

    /// The response parsed but carried GraphQL errors or no `data`.
    #[error("GraphQL error: {0}")]
    GraphQl(String),

    #[error("invalid response (status {status}): {preview}")]
    InvalidResponse { status: u16, preview: String },

    /// Every credential was throttled and the backoff budget is spent.
    #[error("all credentials rate limited after {attempts} backoff rounds")]
    RotationExhausted { attempts: u32 },

    /// Every credential was taken out of rotation after repeated session failures.
    #[error("no usable credentials left ({disabled} disabled after repeated failures)")]
    CredentialsExhausted { disabled: usize },
}

impl HarvestError {
    /// Wrap an `std::io::Error` together with the path it happened on.
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        HarvestError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Whether the job should stop entirely rather than move on to the next term.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarvestError::RotationExhausted { .. }
                | HarvestError::CredentialsExhausted { .. }
                | HarvestError::GraphQl(_)
                | HarvestError::Config(_)
        )
    }

    /// Errors that point at the credential itself (expired or blocked session)
    /// rather than at the request or the network.
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            HarvestError::GraphQl(_) | HarvestError::InvalidResponse { status: 401 | 403, .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(HarvestError::RotationExhausted { attempts: 3 }.is_fatal());
        assert!(HarvestError::GraphQl("missing data".into()).is_fatal());
        assert!(!HarvestError::RateLimited { status: 429 }.is_fatal());
        assert!(
            !HarvestError::InvalidResponse {
                status: 500,
                preview: "oops".into()
            }
            .is_fatal()
        );
        assert!(HarvestError::CredentialsExhausted { disabled: 2 }.is_fatal());
    }

    #[test]
    fn test_session_failure_classification() {
        assert!(HarvestError::GraphQl("login".into()).is_session_failure());
        assert!(
            HarvestError::InvalidResponse {
                status: 401,
                preview: String::new()
            }
            .is_session_failure()
        );
        assert!(
            !HarvestError::InvalidResponse {
                status: 500,
                preview: String::new()
            }
            .is_session_failure()
        );
        assert!(!HarvestError::RateLimited { status: 429 }.is_session_failure());
    }

    #[test]
    fn test_io_error_mentions_path() {
        let err = HarvestError::io(
            "/tmp/state.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/state.json"));
    }
}
