use crate::types::accepts;
use crate::{BusInfo, CanBus, CanFilter, CanFrame, Result, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Default)]
struct MockState {
    open: bool,
    inbound: VecDeque<CanFrame>,
    sent: Vec<CanFrame>,
    filters: Vec<CanFilter>,
    resets: usize,
    shutdowns: usize,
}

struct Shared {
    state: Mutex<MockState>,
    arrived: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| TransportError::Io("mock bus state poisoned".to_string()))
    }
}

/// A simple in-process mock bus. Each bus instance is independent.
///
/// Frames injected through a [`MockPeer`] are queued as if they arrived on
/// the wire; installed filters are applied when they are received, the way a
/// controller would drop them before software ever sees them.
pub struct MockBus {
    name: String,
    shared: Arc<Shared>,
}

impl MockBus {
    /// The far side of the wire, used to inject traffic and inspect writes.
    pub fn peer(&self) -> MockPeer {
        MockPeer {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl CanBus for MockBus {
    fn open(name: &str) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            shared: Arc::new(Shared {
                state: Mutex::new(MockState {
                    open: true,
                    ..MockState::default()
                }),
                arrived: Condvar::new(),
            }),
        })
    }

    fn list() -> Result<Vec<BusInfo>> {
        Ok(vec![BusInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }])
    }

    fn filters(&self) -> Vec<CanFilter> {
        self.shared
            .lock()
            .map(|st| st.filters.clone())
            .unwrap_or_default()
    }

    fn set_filters(&mut self, filters: &[CanFilter]) -> Result<()> {
        let mut st = self.shared.lock()?;
        if !st.open {
            return Err(TransportError::Closed);
        }
        st.filters = filters.to_vec();
        Ok(())
    }

    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame> {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut st = self.shared.lock()?;
        loop {
            if !st.open {
                return Err(TransportError::Closed);
            }
            while let Some(frame) = st.inbound.pop_front() {
                if accepts(&st.filters, &frame.id) {
                    return Ok(frame.stamp_now());
                }
                tracing::trace!(id = %frame.id, bus = %self.name, "mock dropped filtered frame");
            }
            st = match deadline {
                None => self
                    .shared
                    .arrived
                    .wait(st)
                    .map_err(|_| TransportError::Io("mock bus state poisoned".to_string()))?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    self.shared
                        .arrived
                        .wait_timeout(st, deadline - now)
                        .map_err(|_| TransportError::Io("mock bus state poisoned".to_string()))?
                        .0
                }
            };
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let mut st = self.shared.lock()?;
        if !st.open {
            return Err(TransportError::Closed);
        }
        st.sent.push(frame.clone());
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let mut st = self.shared.lock()?;
        if !st.open {
            return Err(TransportError::Closed);
        }
        st.inbound.clear();
        st.resets += 1;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        let mut st = self.shared.lock()?;
        if st.open {
            st.open = false;
            st.inbound.clear();
            st.shutdowns += 1;
            self.shared.arrived.notify_all();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.lock().map(|st| st.open).unwrap_or(false)
    }
}

/// Handle onto a [`MockBus`] that outlives it and can be moved across threads.
#[derive(Clone)]
pub struct MockPeer {
    shared: Arc<Shared>,
}

impl MockPeer {
    /// Queue a frame for the bus to receive. Returns false once the bus is closed.
    pub fn inject(&self, frame: CanFrame) -> bool {
        match self.shared.lock() {
            Ok(mut st) if st.open => {
                st.inbound.push_back(frame);
                self.shared.arrived.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Frames the bus has transmitted so far.
    pub fn sent(&self) -> Vec<CanFrame> {
        self.shared
            .lock()
            .map(|st| st.sent.clone())
            .unwrap_or_default()
    }

    pub fn filters(&self) -> Vec<CanFilter> {
        self.shared
            .lock()
            .map(|st| st.filters.clone())
            .unwrap_or_default()
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().map(|st| st.open).unwrap_or(false)
    }

    pub fn reset_count(&self) -> usize {
        self.shared.lock().map(|st| st.resets).unwrap_or(0)
    }

    /// Number of times the bus actually transitioned from open to closed.
    pub fn shutdown_count(&self) -> usize {
        self.shared.lock().map(|st| st.shutdowns).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CanId;

    fn frame(id: u16) -> CanFrame {
        CanFrame::new(CanId::standard(id).unwrap(), &[1, 2, 3]).unwrap()
    }

    #[test]
    fn test_recv_times_out_when_idle() {
        let mut bus = MockBus::open("mock0").unwrap();
        assert!(matches!(bus.recv(Some(10)), Err(TransportError::Timeout)));
    }

    #[test]
    fn test_injected_frames_respect_filters() -> anyhow::Result<()> {
        let mut bus = MockBus::open("mock0")?;
        let peer = bus.peer();
        bus.set_filters(&[CanFilter::new(0x100, 0xFFF, false)])?;
        assert!(peer.inject(frame(0x300)));
        assert!(peer.inject(frame(0x100)));
        let got = bus.recv(Some(50))?;
        assert_eq!(got.id.raw(), 0x100);
        assert!(got.timestamp.is_some());
        assert!(matches!(bus.recv(Some(10)), Err(TransportError::Timeout)));
        Ok(())
    }

    #[test]
    fn test_shutdown_closes_and_is_idempotent() -> anyhow::Result<()> {
        let mut bus = MockBus::open("mock0")?;
        let peer = bus.peer();
        bus.send(&frame(0x10))?;
        bus.reset()?;
        bus.shutdown()?;
        bus.shutdown()?;
        assert!(!bus.is_open());
        assert_eq!(peer.shutdown_count(), 1);
        assert_eq!(peer.reset_count(), 1);
        assert_eq!(peer.sent().len(), 1);
        assert!(!peer.inject(frame(0x10)));
        assert!(matches!(bus.send(&frame(0x10)), Err(TransportError::Closed)));
        assert!(matches!(bus.recv(Some(5)), Err(TransportError::Closed)));
        Ok(())
    }

    #[test]
    fn test_recv_wakes_on_inject() -> anyhow::Result<()> {
        let mut bus = MockBus::open("mock0")?;
        let peer = bus.peer();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            peer.inject(frame(0x42))
        });
        let got = bus.recv(Some(2000))?;
        assert_eq!(got.id.raw(), 0x42);
        assert!(t.join().unwrap());
        Ok(())
    }
}
