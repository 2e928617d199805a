use can_transport::TransportError;
use thiserror::Error;

pub type Result<T, E = ConnectionError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("bus handle is not open")]
    InvalidBusHandle,
    #[error("connection has no dispatch loop (external bus or already shut down)")]
    NoDispatchLoop,
    #[error("transmit failed: {0}")]
    TransmitFailure(#[source] TransportError),
    #[error("filter install failed: {0}")]
    FilterInstallFailure(#[source] TransportError),
    #[error("failed to start dispatch thread: {0}")]
    Spawn(String),
}
