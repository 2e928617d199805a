//! Background reader that fans accepted frames out to every listener.

use crate::listener::{Callback, ListenerId, ListenerRegistry};
use crate::{ConnectionConfig, ConnectionError, Result, SharedBus};
use can_transport::{CanBus, CanFrame, TransportError};
use parking_lot::{Mutex, MutexGuard};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchState {
    Stopped,
    Running,
    Stopping,
}

impl DispatchState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DispatchState::Running,
            2 => DispatchState::Stopping,
            _ => DispatchState::Stopped,
        }
    }
}

/// Counters kept by the dispatch thread.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchStats {
    pub frames_dispatched: u64,
    pub listener_faults: u64,
    pub recv_errors: u64,
}

#[derive(Default)]
struct Shared {
    state: AtomicU8,
    registry: ListenerRegistry,
    frames_dispatched: AtomicU64,
    listener_faults: AtomicU64,
    recv_errors: AtomicU64,
}

impl Shared {
    fn state(&self) -> DispatchState {
        DispatchState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DispatchState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// One-shot dispatch loop: Stopped -> Running -> Stopping -> Stopped.
pub(crate) struct DispatchLoop {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchLoop {
    /// Spawn the dispatch thread with `initial` as the first listener.
    pub(crate) fn start<B>(
        bus: SharedBus<B>,
        initial: Callback,
        config: &ConnectionConfig,
    ) -> Result<Self>
    where
        B: CanBus + 'static,
    {
        let shared = Arc::new(Shared::default());
        shared
            .registry
            .register(initial)
            .ok_or(ConnectionError::NoDispatchLoop)?;
        shared.set_state(DispatchState::Running);

        let worker = Arc::clone(&shared);
        let read_timeout = config.read_timeout_ms.max(1);
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run(bus, worker, read_timeout))
            .map_err(|e| {
                shared.set_state(DispatchState::Stopped);
                ConnectionError::Spawn(e.to_string())
            })?;
        tracing::info!(thread = %config.thread_name, "dispatch loop running");
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Fails once the loop has begun stopping; the check and the insert
    /// happen under the registry lock that `stop` closes.
    pub(crate) fn add_listener(&self, callback: Callback) -> Result<ListenerId> {
        self.shared
            .registry
            .register(callback)
            .ok_or(ConnectionError::NoDispatchLoop)
    }

    pub(crate) fn state(&self) -> DispatchState {
        self.shared.state()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub(crate) fn stats(&self) -> DispatchStats {
        DispatchStats {
            frames_dispatched: self.shared.frames_dispatched.load(Ordering::Relaxed),
            listener_faults: self.shared.listener_faults.load(Ordering::Relaxed),
            recv_errors: self.shared.recv_errors.load(Ordering::Relaxed),
        }
    }

    /// Halt reading and drop every listener. No callback runs after this
    /// returns, except when called from a callback on the dispatch thread:
    /// then the frame in flight stops reaching further listeners and the
    /// thread exits on its own.
    pub(crate) fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        self.shared.set_state(DispatchState::Stopping);
        self.shared.registry.close();
        if handle.thread().id() == thread::current().id() {
            // the thread marks itself Stopped on the way out
            tracing::debug!("stop requested from dispatch thread; not joining");
            return;
        }
        if handle.join().is_err() {
            tracing::error!("dispatch thread terminated abnormally");
        }
        self.shared.set_state(DispatchState::Stopped);
        tracing::info!("dispatch loop stopped");
    }
}

fn run<B: CanBus>(bus: SharedBus<B>, shared: Arc<Shared>, read_timeout_ms: u64) {
    while shared.state() == DispatchState::Running {
        let received = {
            let mut guard = bus.lock();
            let res = guard.recv(Some(read_timeout_ms));
            // let waiting transmitters and filter installs in before the next read
            MutexGuard::unlock_fair(guard);
            res
        };
        match received {
            Ok(frame) => dispatch(&shared, &frame),
            Err(TransportError::Timeout) => {}
            Err(TransportError::Closed) => {
                tracing::warn!("bus closed underneath dispatch loop");
                break;
            }
            Err(e) => {
                shared.recv_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "bus read failed");
                thread::sleep(Duration::from_millis(read_timeout_ms));
            }
        }
    }
    shared.registry.close();
    shared.set_state(DispatchState::Stopped);
}

fn dispatch(shared: &Shared, frame: &CanFrame) {
    tracing::debug!(id = %frame.id, len = frame.len, "dispatching frame");
    for listener in shared.registry.snapshot() {
        if shared.state() != DispatchState::Running {
            return;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (listener.callback)(frame)));
        if let Err(payload) = outcome {
            shared.listener_faults.fetch_add(1, Ordering::Relaxed);
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(listener = %listener.id, id = %frame.id, %reason, "listener callback panicked");
        }
    }
    shared.frames_dispatched.fetch_add(1, Ordering::Relaxed);
}
