use crate::{BusInfo, CanFilter, CanFrame, Result, TransportError};

/// A minimal blocking CAN bus interface.
///
/// Once [`CanBus::shutdown`] has been called every other operation fails
/// with [`TransportError::Closed`].
pub trait CanBus: Send {
    /// Open a CAN interface by name (e.g., "can0", "slcan0").
    fn open(name: &str) -> Result<Self>
    where
        Self: Sized;

    /// Attempt to list available interfaces for this backend.
    fn list() -> Result<Vec<BusInfo>>
    where
        Self: Sized;

    /// Acceptance filters currently installed. Empty means accept all.
    fn filters(&self) -> Vec<CanFilter> {
        Vec::new()
    }

    /// Replace the installed acceptance filters with `filters`.
    fn set_filters(&mut self, _filters: &[CanFilter]) -> Result<()> {
        let _ = _filters;
        Err(TransportError::Unsupported("filters not supported"))
    }

    /// Receive one frame (blocking with optional timeout in milliseconds).
    fn recv(&mut self, _timeout_ms: Option<u64>) -> Result<CanFrame>;

    /// Send one frame.
    fn send(&mut self, frame: &CanFrame) -> Result<()>;

    /// Return the interface to a neutral state: pending frames dropped,
    /// error counters cleared. Filters are kept.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the interface. Calling it again is a no-op.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}
