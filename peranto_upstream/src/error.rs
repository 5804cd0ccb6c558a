use http::StatusCode;
use peranto::{BoxError, ProblemKind};
use thiserror::Error;

/// The ways a call to the upstream identity API can fail
///
/// Upstream rejections of well-formed requests keep their original status
/// so callers see what the upstream said; infrastructure failures are
/// reported as a bad gateway.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream rejected the request with a non-retryable status
    #[error("upstream rejected the request with status {status}")]
    Rejected {
        /// The status the upstream responded with
        status: StatusCode,
        /// The upstream's response body, when one was returned
        body: serde_json::Value,
    },

    /// The request kept failing with retryable statuses until the retry
    /// budget ran out
    #[error("upstream request failed after {attempts} attempts, last status {status}")]
    Exhausted {
        /// How many attempts were made
        attempts: u32,
        /// The status of the final attempt
        status: StatusCode,
        /// The body of the final attempt
        body: serde_json::Value,
    },

    /// The request could not be delivered at all
    #[error("error communicating with the upstream identity API")]
    Transport(#[source] BoxError),

    /// A service token could not be obtained
    #[error("unable to obtain service credentials for the upstream identity API")]
    Credential(#[source] BoxError),

    /// The upstream response could not be interpreted
    #[error("unexpected upstream response shape: {0}")]
    Decode(&'static str),

    /// The resource to create already exists and the existing copy was not
    /// acceptable
    #[error("{resource} already exists as '{existing_id}'")]
    Conflict {
        /// What kind of resource collided
        resource: &'static str,
        /// The identifier of the existing resource
        existing_id: String,
    },
}

impl ProblemKind for UpstreamError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Rejected { status, .. } => *status,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Exhausted { .. } | Self::Transport(_) | Self::Credential(_) | Self::Decode(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "upstream_rejected",
            Self::Exhausted { .. } => "upstream_exhausted",
            Self::Transport(_) => "upstream_unreachable",
            Self::Credential(_) => "upstream_credentials",
            Self::Decode(_) => "upstream_decode",
            Self::Conflict { .. } => "already_exists",
        }
    }
}
