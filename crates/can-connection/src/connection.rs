use crate::dispatch::{DispatchLoop, DispatchState, DispatchStats};
use crate::filter::{FilterEntry, FilterTable};
use crate::listener::ListenerId;
use crate::{ConnectionConfig, ConnectionError, Result};
use can_transport::{CanBus, CanFrame, CanId, TransportError};
use parking_lot::Mutex;
use std::sync::Arc;

/// A bus handle shared between the dispatch thread and callers.
pub type SharedBus<B> = Arc<Mutex<B>>;

/// Who is responsible for resetting and closing the bus.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BusOwnership {
    /// Created for this connection; closed by [`CanConnection::shutdown`].
    Owned,
    /// Supplied by someone else; never reset or closed here.
    External,
}

/// One bus handle multiplexed among several listeners.
///
/// Owned connections run a dispatch thread that hands every frame passing
/// the bus's acceptance filters to every listener, in registration order.
/// External connections only borrow the bus: they can transmit and add
/// filters, but have no dispatch loop of their own.
pub struct CanConnection<B: CanBus + 'static> {
    bus: Mutex<Option<SharedBus<B>>>,
    ownership: BusOwnership,
    dispatch: Option<DispatchLoop>,
    config: ConnectionConfig,
}

impl<B: CanBus + 'static> CanConnection<B> {
    /// Take ownership of `bus`, install `filter` and start dispatching to `callback`.
    pub fn new<F>(callback: F, filter: u32, bus: B, config: ConnectionConfig) -> Result<Self>
    where
        F: Fn(&CanFrame) + Send + Sync + 'static,
    {
        Self::create(
            callback,
            filter,
            Arc::new(Mutex::new(bus)),
            BusOwnership::Owned,
            config,
        )
    }

    /// Borrow a bus owned elsewhere. No listener, filter or dispatch loop
    /// is set up.
    pub fn external(bus: SharedBus<B>, config: ConnectionConfig) -> Result<Self> {
        Self::create(|_: &CanFrame| {}, 0, bus, BusOwnership::External, config)
    }

    /// `callback` and `filter` are ignored for [`BusOwnership::External`].
    pub fn create<F>(
        callback: F,
        filter: u32,
        bus: SharedBus<B>,
        ownership: BusOwnership,
        config: ConnectionConfig,
    ) -> Result<Self>
    where
        F: Fn(&CanFrame) + Send + Sync + 'static,
    {
        if !bus.lock().is_open() {
            return Err(ConnectionError::InvalidBusHandle);
        }

        let dispatch = match ownership {
            BusOwnership::External => {
                tracing::debug!("borrowing external bus; dispatch loop not started");
                None
            }
            BusOwnership::Owned => {
                // filter first so nothing outside it reaches the first listener
                let installed = FilterTable::append_to(&mut *bus.lock(), filter);
                if let Err(e) = installed {
                    close_bus(&bus);
                    return Err(e);
                }
                match DispatchLoop::start(Arc::clone(&bus), Arc::new(callback), &config) {
                    Ok(dispatch) => Some(dispatch),
                    Err(e) => {
                        close_bus(&bus);
                        return Err(e);
                    }
                }
            }
        };

        Ok(Self {
            bus: Mutex::new(Some(bus)),
            ownership,
            dispatch,
            config,
        })
    }

    /// Register another listener on the running dispatch loop.
    pub fn add_callback<F>(&self, callback: F) -> Result<ListenerId>
    where
        F: Fn(&CanFrame) + Send + Sync + 'static,
    {
        let dispatch = self
            .dispatch
            .as_ref()
            .ok_or(ConnectionError::NoDispatchLoop)?;
        let id = dispatch.add_listener(Arc::new(callback))?;
        tracing::debug!(listener = %id, "listener registered");
        Ok(id)
    }

    /// Widen the bus's acceptance to include `filter`. Applies to every
    /// listener, present and future.
    pub fn add_filter(&self, filter: u32) -> Result<()> {
        let bus = self
            .get_bus()
            .ok_or(ConnectionError::FilterInstallFailure(TransportError::Closed))?;
        let mut guard = bus.lock();
        FilterTable::append_to(&mut *guard, filter)?;
        Ok(())
    }

    /// Send `data` as an FD frame with arbitration id `req_id`.
    pub fn transmit(&self, data: &[u8], req_id: u32, extended: bool) -> Result<()> {
        let frame = self.frame_for(data, req_id, extended)?;
        let bus = self
            .get_bus()
            .ok_or(ConnectionError::TransmitFailure(TransportError::Closed))?;
        let mut guard = bus.lock();
        guard
            .send(&frame)
            .map_err(ConnectionError::TransmitFailure)?;
        tracing::trace!(id = %frame.id, len = frame.len, "frame transmitted");
        Ok(())
    }

    fn frame_for(&self, data: &[u8], req_id: u32, extended: bool) -> Result<CanFrame> {
        let id = CanId::from_raw(req_id, extended).ok_or(ConnectionError::TransmitFailure(
            TransportError::InvalidFrame("arbitration id out of range"),
        ))?;
        let mut frame = CanFrame::new_fd(id, data).ok_or(ConnectionError::TransmitFailure(
            TransportError::InvalidFrame("payload longer than 64 bytes"),
        ))?;
        frame.brs = self.config.bitrate_switch;
        Ok(frame)
    }

    /// Stop dispatching and, for an owned bus, reset and close it. Borrowed
    /// buses are left untouched. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.ownership == BusOwnership::External {
            return;
        }
        if let Some(dispatch) = &self.dispatch {
            dispatch.stop();
        }
        let Some(bus) = self.bus.lock().take() else {
            return;
        };
        close_bus(&bus);
        tracing::info!("connection shut down");
    }

    /// The bus handle, or `None` once an owned connection has shut down.
    pub fn get_bus(&self) -> Option<SharedBus<B>> {
        self.bus.lock().clone()
    }

    pub fn ownership(&self) -> BusOwnership {
        self.ownership
    }

    /// Snapshot of the filters currently installed on the bus.
    pub fn filters(&self) -> Vec<FilterEntry> {
        self.get_bus()
            .map(|bus| bus.lock().filters())
            .unwrap_or_default()
    }

    pub fn dispatch_state(&self) -> DispatchState {
        self.dispatch
            .as_ref()
            .map(DispatchLoop::state)
            .unwrap_or(DispatchState::Stopped)
    }

    pub fn listener_count(&self) -> usize {
        self.dispatch
            .as_ref()
            .map(DispatchLoop::listener_count)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatch
            .as_ref()
            .map(DispatchLoop::stats)
            .unwrap_or_default()
    }
}

impl<B: CanBus + 'static> Drop for CanConnection<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn close_bus<B: CanBus>(bus: &SharedBus<B>) {
    let mut guard = bus.lock();
    if let Err(e) = guard.reset() {
        tracing::warn!(error = %e, "bus reset failed");
    }
    if let Err(e) = guard.shutdown() {
        tracing::warn!(error = %e, "bus shutdown failed");
    }
}
