use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Busy,
    NotReady,
    NoSandbox,
    SandboxLost,
    SandboxError,
    PromptTimeout,
    Unauthorized,
    Forbidden,
    RateLimited,
    BadRequest,
    Upstream,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::Busy => "urn:sandbox-broker:error:busy",
            Self::NotReady => "urn:sandbox-broker:error:not_ready",
            Self::NoSandbox => "urn:sandbox-broker:error:no_sandbox",
            Self::SandboxLost => "urn:sandbox-broker:error:sandbox_lost",
            Self::SandboxError => "urn:sandbox-broker:error:sandbox_error",
            Self::PromptTimeout => "urn:sandbox-broker:error:prompt_timeout",
            Self::Unauthorized => "urn:sandbox-broker:error:unauthorized",
            Self::Forbidden => "urn:sandbox-broker:error:forbidden",
            Self::RateLimited => "urn:sandbox-broker:error:rate_limited",
            Self::BadRequest => "urn:sandbox-broker:error:bad_request",
            Self::Upstream => "urn:sandbox-broker:error:upstream",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Busy => "Busy",
            Self::NotReady => "Not Ready",
            Self::NoSandbox => "No Sandbox",
            Self::SandboxLost => "Sandbox Lost",
            Self::SandboxError => "Sandbox Error",
            Self::PromptTimeout => "Prompt Timeout",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::RateLimited => "Rate Limited",
            Self::BadRequest => "Bad Request",
            Self::Upstream => "Upstream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Busy => 400,
            Self::NotReady => 400,
            Self::NoSandbox => 400,
            Self::SandboxLost => 400,
            Self::SandboxError => 502,
            Self::PromptTimeout => 504,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::RateLimited => 429,
            Self::BadRequest => 400,
            Self::Upstream => 502,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            extensions: Map::new(),
        }
    }
}

/// Failure kinds for calls to the sandbox provider, the agent server, and
/// the database of record. `NetworkTimeout` and `Transient5xx` are the only
/// retryable kinds; `Conflict` carries the pause-when-already-dead fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamKind {
    NetworkTimeout,
    Transient5xx,
    NotFound,
    Conflict,
    BadRequest,
    Unauthorized,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct UpstreamError {
    pub kind: UpstreamKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            UpstreamKind::NetworkTimeout | UpstreamKind::Transient5xx
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == UpstreamKind::NetworkTimeout
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("a prompt is already in flight")]
    Busy,
    #[error("sandbox is starting")]
    NotReady,
    #[error("no running sandbox and no snapshot")]
    NoSandbox,
    #[error("sandbox unreachable: {message}")]
    SandboxLost { message: String },
    #[error("sandbox error: {message}")]
    SandboxError { message: String },
    #[error("prompt timed out")]
    PromptTimeout,
    #[error("unauthorized")]
    Unauthorized { message: Option<String> },
    #[error("forbidden")]
    Forbidden { message: Option<String> },
    #[error("rate limited")]
    RateLimited { reset_at_ms: i64 },
    #[error("bad request: {message}")]
    BadRequest { message: String },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl BrokerError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn sandbox_error(message: impl Into<String>) -> Self {
        Self::SandboxError {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Busy => ErrorType::Busy,
            Self::NotReady => ErrorType::NotReady,
            Self::NoSandbox => ErrorType::NoSandbox,
            Self::SandboxLost { .. } => ErrorType::SandboxLost,
            Self::SandboxError { .. } => ErrorType::SandboxError,
            Self::PromptTimeout => ErrorType::PromptTimeout,
            Self::Unauthorized { .. } => ErrorType::Unauthorized,
            Self::Forbidden { .. } => ErrorType::Forbidden,
            Self::RateLimited { .. } => ErrorType::RateLimited,
            Self::BadRequest { .. } => ErrorType::BadRequest,
            Self::Upstream(_) => ErrorType::Upstream,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        if let Self::RateLimited { reset_at_ms } = self {
            problem.extensions.insert(
                "resetAt".to_string(),
                Value::Number(serde_json::Number::from(*reset_at_ms)),
            );
        }
        problem
    }
}

impl From<BrokerError> for ProblemDetails {
    fn from(value: BrokerError) -> Self {
        value.to_problem_details()
    }
}

impl From<&BrokerError> for ProblemDetails {
    fn from(value: &BrokerError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(ErrorType::Busy.status_code(), 400);
        assert_eq!(ErrorType::Unauthorized.status_code(), 401);
        assert_eq!(ErrorType::Forbidden.status_code(), 403);
        assert_eq!(ErrorType::RateLimited.status_code(), 429);
        assert_eq!(ErrorType::SandboxError.status_code(), 502);
    }

    #[test]
    fn only_timeouts_and_5xx_retry() {
        for kind in [
            UpstreamKind::NetworkTimeout,
            UpstreamKind::Transient5xx,
            UpstreamKind::NotFound,
            UpstreamKind::Conflict,
            UpstreamKind::BadRequest,
            UpstreamKind::Unauthorized,
        ] {
            let err = UpstreamError::new(kind, "x");
            assert_eq!(
                err.is_retryable(),
                matches!(
                    kind,
                    UpstreamKind::NetworkTimeout | UpstreamKind::Transient5xx
                )
            );
        }
    }

    #[test]
    fn rate_limit_problem_carries_reset() {
        let problem = BrokerError::RateLimited { reset_at_ms: 1234 }.to_problem_details();
        assert_eq!(problem.status, 429);
        assert_eq!(problem.extensions.get("resetAt").unwrap(), 1234);
    }
}
