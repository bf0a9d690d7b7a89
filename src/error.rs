//! Typed errors for the council core
//!
//! The router and stage engine never bubble raw transport errors to the HTTP
//! layer; instead every failure is classified into one of these kinds so the
//! retry helper and the fallback paths can branch on it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CouncilError {
    /// Connect or read deadline exceeded. The only retriable kind.
    #[error("timeout talking to {endpoint}: {detail}")]
    Timeout { endpoint: String, detail: String },

    /// Non-timeout transport failure (connection refused, HTTP error status).
    #[error("transport error from {endpoint}: {detail}")]
    Transport { endpoint: String, detail: String },

    /// Response arrived but could not be decoded into the expected shape.
    #[error("parse error: {0}")]
    Parse(String),

    /// Model produced no usable content (and no reasoning fallback).
    #[error("model {model} returned empty output")]
    Empty { model: String },

    /// Model ignored tool output and refused with a canned phrase.
    #[error("model {model} refused despite tool data")]
    Refusal { model: String },

    /// A tool reported failure, either in the outer envelope or inner JSON.
    #[error("tool {tool} failed: {detail}")]
    ToolFailed { tool: String, detail: String },

    /// The requested collaborator (server, tool, memory) is not available.
    #[error("{0} unavailable")]
    Unavailable(String),
}

impl CouncilError {
    /// Only timeouts are worth retrying; everything else fails fast.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CouncilError::Timeout { .. })
    }

    pub fn timeout(endpoint: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        CouncilError::Timeout {
            endpoint: endpoint.into(),
            detail: detail.to_string(),
        }
    }

    pub fn transport(endpoint: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        CouncilError::Transport {
            endpoint: endpoint.into(),
            detail: detail.to_string(),
        }
    }

    /// Classify a reqwest error against an endpoint.
    pub fn from_reqwest(endpoint: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            CouncilError::timeout(endpoint, err)
        } else {
            CouncilError::transport(endpoint, err)
        }
    }
}

pub type CouncilResult<T> = Result<T, CouncilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_retriable() {
        assert!(CouncilError::timeout("http://x", "read").is_retriable());
        assert!(!CouncilError::transport("http://x", "refused").is_retriable());
        assert!(!CouncilError::Parse("bad json".into()).is_retriable());
        assert!(
            !CouncilError::Empty {
                model: "m".into()
            }
            .is_retriable()
        );
    }
}
