//! Boundary rendering of core errors
//!
//! The core returns typed errors; the transport layer turns them into
//! response documents here. Internal details (sources, stack traces) stay
//! out of the rendered form: callers see a stable code, a human-readable
//! message, and a correlation identifier for tracing.

use http::StatusCode;
use serde::Serialize;

use crate::ids::CorrelationId;

/// An error that knows how it should be presented at the HTTP boundary
pub trait ProblemKind: std::error::Error {
    /// The HTTP status the error maps to
    fn status(&self) -> StatusCode;

    /// A stable machine-readable code for the error
    fn code(&self) -> &'static str;

    /// The message safe to show to callers
    ///
    /// Defaults to the error's display form, which for core error types
    /// never embeds internal details.
    fn public_message(&self) -> String {
        self.to_string()
    }
}

/// The rendered form of a core error
#[derive(Clone, Debug, Serialize)]
pub struct Problem {
    /// The HTTP status code to respond with
    #[serde(skip)]
    pub status: StatusCode,
    /// Stable machine-readable code
    pub code: &'static str,
    /// Human-readable message
    pub message: String,
    /// Identifier correlating this response with traces and logs
    pub correlation_id: CorrelationId,
}

impl Problem {
    /// Renders an error with the given correlation identifier
    pub fn from_error<E>(error: &E, correlation_id: CorrelationId) -> Self
    where
        E: ProblemKind + ?Sized,
    {
        Self {
            status: error.status(),
            code: error.code(),
            message: error.public_message(),
            correlation_id,
        }
    }

    /// Renders an error under a freshly generated correlation identifier
    pub fn from_error_untraced<E>(error: &E) -> Self
    where
        E: ProblemKind + ?Sized,
    {
        Self::from_error(error, CorrelationId::random())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuthError;

    #[test]
    fn renders_status_code_and_message() {
        let err = AuthError::TokenExpired;
        let problem = Problem::from_error_untraced(&err);

        assert_eq!(problem.status, StatusCode::UNAUTHORIZED);
        assert_eq!(problem.code, "token_expired");
        assert_eq!(problem.message, "bearer token has expired");
    }

    #[test]
    fn serialized_form_omits_the_status() {
        let err = AuthError::MissingToken;
        let problem = Problem::from_error(&err, CorrelationId::from_static("abc123"));
        let json = serde_json::to_value(&problem).unwrap();

        assert_eq!(json["code"], "missing_token");
        assert_eq!(json["correlation_id"], "abc123");
        assert!(json.get("status").is_none());
    }
}
