//! Centralized error types for Peerlink.
//!
//! Uses `thiserror` for ergonomic error definitions. Every variant carries enough
//! context to be logged on its own, because the negotiation core reports errors
//! instead of propagating them to a caller that could retry.

/// Core error type used across all Peerlink crates.
#[derive(Debug, thiserror::Error)]
pub enum PeerlinkError {
    // === Session lifecycle ===
    /// An operation was requested while an incompatible session/state exists.
    #[error("Conflict during {operation}: {reason}")]
    Conflict { operation: String, reason: String },

    /// An operation requires a session that does not exist.
    #[error("No active session for {operation}")]
    MissingSession { operation: String },

    // === Negotiation ===
    /// The media engine rejected a description or a step of the handshake failed.
    #[error("Negotiation failed at {stage}: {reason}")]
    Negotiation { stage: String, reason: String },

    /// A candidate, description or data-channel payload failed to parse.
    #[error("Malformed {what}: {reason}")]
    MalformedPayload { what: String, reason: String },

    // === Infrastructure ===
    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PeerlinkError {
    pub fn conflict(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_session(operation: impl Into<String>) -> Self {
        Self::MissingSession {
            operation: operation.into(),
        }
    }

    pub fn negotiation(stage: impl Into<String>, reason: impl ToString) -> Self {
        Self::Negotiation {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedPayload {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    /// Error code string for programmatic handling and log filtering.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Conflict { .. } => "CONFLICT",
            Self::MissingSession { .. } => "MISSING_SESSION",
            Self::Negotiation { .. } => "NEGOTIATION_FAILED",
            Self::MalformedPayload { .. } => "MALFORMED_PAYLOAD",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error leaves the session unusable.
    ///
    /// Conflicts, missing sessions and malformed payloads are rejected before
    /// they touch session state; the others may have interrupted a commit.
    pub fn affects_session(&self) -> bool {
        matches!(
            self,
            Self::Negotiation { .. } | Self::Transport(_) | Self::Internal(_)
        )
    }
}

impl From<serde_json::Error> for PeerlinkError {
    fn from(e: serde_json::Error) -> Self {
        Self::malformed("JSON payload", e)
    }
}

/// Convenience type alias for Results using PeerlinkError.
pub type PeerlinkResult<T> = Result<T, PeerlinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(PeerlinkError::conflict("connect", "exists").error_code(), "CONFLICT");
        assert_eq!(
            PeerlinkError::missing_session("answer").error_code(),
            "MISSING_SESSION"
        );
        assert_eq!(
            PeerlinkError::Transport("closed".into()).error_code(),
            "TRANSPORT_ERROR"
        );
    }

    #[test]
    fn json_errors_become_malformed_payloads() {
        let err: PeerlinkError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, PeerlinkError::MalformedPayload { .. }));
        assert!(!err.affects_session());
    }

    #[test]
    fn negotiation_failures_affect_the_session() {
        let err = PeerlinkError::negotiation("set_remote_description", "bad fingerprint");
        assert!(err.affects_session());
        assert_eq!(
            err.to_string(),
            "Negotiation failed at set_remote_description: bad fingerprint"
        );
    }
}
