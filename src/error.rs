use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecourtErrorCode {
    Io,
    TransportClosed,
    TransportFraming,
    ResourceLimitReached,
    SessionClosed,
    HandshakeFailed,
    ServiceNotFound,
    ServiceError,
    TaskPanic,
    ConfigParse,
    ConfigOrphan,
    SessionAmbiguous,
    SessionNotFound,
    VariableTypeMismatch,
    ShutdownInProgress,
}

impl ForecourtErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ForecourtErrorCode::Io => "io",
            ForecourtErrorCode::TransportClosed => "transport_closed",
            ForecourtErrorCode::TransportFraming => "transport_framing",
            ForecourtErrorCode::ResourceLimitReached => "resource_limit_reached",
            ForecourtErrorCode::SessionClosed => "session_closed",
            ForecourtErrorCode::HandshakeFailed => "handshake_failed",
            ForecourtErrorCode::ServiceNotFound => "service_not_found",
            ForecourtErrorCode::ServiceError => "service_error",
            ForecourtErrorCode::TaskPanic => "task_panic",
            ForecourtErrorCode::ConfigParse => "config_parse",
            ForecourtErrorCode::ConfigOrphan => "config_orphan",
            ForecourtErrorCode::SessionAmbiguous => "session_ambiguous",
            ForecourtErrorCode::SessionNotFound => "session_not_found",
            ForecourtErrorCode::VariableTypeMismatch => "variable_type_mismatch",
            ForecourtErrorCode::ShutdownInProgress => "shutdown_in_progress",
        }
    }
}

#[derive(Debug, Error)]
pub enum ForecourtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport closed")]
    TransportClosed,
    #[error("transport framing error: {0}")]
    TransportFraming(String),
    #[error("resource limit reached: {0}")]
    ResourceLimitReached(String),
    #[error("session closed")]
    SessionClosed,
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("service not found: service_id={service_id}")]
    ServiceNotFound { service_id: u32 },
    #[error("service error: {0}")]
    ServiceError(String),
    #[error("task panicked")]
    TaskPanic,
    #[error("configuration parse error: {0}")]
    ConfigParse(String),
    #[error("orphan entry error: section '{section}' is not recognized")]
    ConfigOrphan { section: String },
    #[error("session specifier matches multiple sessions")]
    SessionAmbiguous,
    #[error("session not found")]
    SessionNotFound,
    #[error("variable '{name}' type mismatch")]
    VariableTypeMismatch { name: String },
    #[error("session shutdown is in progress")]
    ShutdownInProgress,
}

impl ForecourtError {
    pub fn code(&self) -> ForecourtErrorCode {
        match self {
            ForecourtError::Io(_) => ForecourtErrorCode::Io,
            ForecourtError::TransportClosed => ForecourtErrorCode::TransportClosed,
            ForecourtError::TransportFraming(_) => ForecourtErrorCode::TransportFraming,
            ForecourtError::ResourceLimitReached(_) => ForecourtErrorCode::ResourceLimitReached,
            ForecourtError::SessionClosed => ForecourtErrorCode::SessionClosed,
            ForecourtError::HandshakeFailed(_) => ForecourtErrorCode::HandshakeFailed,
            ForecourtError::ServiceNotFound { .. } => ForecourtErrorCode::ServiceNotFound,
            ForecourtError::ServiceError(_) => ForecourtErrorCode::ServiceError,
            ForecourtError::TaskPanic => ForecourtErrorCode::TaskPanic,
            ForecourtError::ConfigParse(_) => ForecourtErrorCode::ConfigParse,
            ForecourtError::ConfigOrphan { .. } => ForecourtErrorCode::ConfigOrphan,
            ForecourtError::SessionAmbiguous => ForecourtErrorCode::SessionAmbiguous,
            ForecourtError::SessionNotFound => ForecourtErrorCode::SessionNotFound,
            ForecourtError::VariableTypeMismatch { .. } => ForecourtErrorCode::VariableTypeMismatch,
            ForecourtError::ShutdownInProgress => ForecourtErrorCode::ShutdownInProgress,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::{ForecourtError, ForecourtErrorCode};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(
            ForecourtErrorCode::ResourceLimitReached.as_str(),
            "resource_limit_reached"
        );
        assert_eq!(
            ForecourtErrorCode::VariableTypeMismatch.as_str(),
            "variable_type_mismatch"
        );
        assert_eq!(ForecourtErrorCode::ConfigOrphan.as_str(), "config_orphan");
    }

    #[test]
    fn error_code_matches_variant_mapping() {
        let err = ForecourtError::ServiceNotFound { service_id: 77 };
        assert_eq!(err.code(), ForecourtErrorCode::ServiceNotFound);
        assert_eq!(err.code_str(), "service_not_found");
        assert_eq!(err.to_string(), "service not found: service_id=77");
    }
}
