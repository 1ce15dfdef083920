use crate::message::ResultCode;

/// Everything that can go wrong while bringing a backend up. All variants
/// are recovered locally and reported to the originating client; none is
/// fatal to the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("malformed message: {0}")]
    Protocol(String),
    #[error("no backend registered for protocol '{0}'")]
    Lookup(String),
    #[error("failed to launch '{0}': {1}")]
    Launch(String, String),
    #[error("'{0}' did not become reachable within {1}s")]
    ReadinessTimeout(String, u64),
}

impl BrokerError {
    /// Result code reported to the client for this failure.
    pub fn result_code(&self) -> ResultCode {
        match self {
            BrokerError::Protocol(_) => ResultCode::BadMessage,
            BrokerError::Lookup(_) => ResultCode::NoServiceAvailable,
            BrokerError::Launch(..) => ResultCode::ServiceDenied,
            BrokerError::ReadinessTimeout(..) => ResultCode::ServerError,
        }
    }
}
