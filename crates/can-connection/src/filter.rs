//! Aggregated acceptance filters shared by every listener of a connection.

use crate::{ConnectionError, Result};
use can_transport::{accepts, CanBus, CanFilter, CanId};

/// Mask applied to every entry added through a connection.
pub const FILTER_MASK: u32 = 0xFFF;

/// One installed acceptance rule.
pub type FilterEntry = CanFilter;

/// Ordered, append-only set of acceptance rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterTable {
    entries: Vec<FilterEntry>,
}

impl FilterTable {
    /// Standard-id entry with the fixed mask.
    pub fn entry(id: u32) -> FilterEntry {
        CanFilter::new(id, FILTER_MASK, false)
    }

    pub fn from_installed(filters: Vec<CanFilter>) -> Self {
        Self { entries: filters }
    }

    pub fn push(&mut self, entry: FilterEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[FilterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Same acceptance rule the bus applies. An empty table accepts all.
    pub fn accepts(&self, id: &CanId) -> bool {
        accepts(&self.entries, id)
    }

    /// Read the bus's table, append `id`, and write the whole table back.
    ///
    /// The caller must hold the bus lock for the duration so that frame
    /// acceptance never observes a half-applied table.
    pub fn append_to<B: CanBus + ?Sized>(bus: &mut B, id: u32) -> Result<FilterTable> {
        let mut table = FilterTable::from_installed(bus.filters());
        table.push(Self::entry(id));
        bus.set_filters(table.entries())
            .map_err(ConnectionError::FilterInstallFailure)?;
        tracing::debug!(filter_id = id, total = table.len(), "installed filter table");
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_transport::MockBus;

    #[test]
    fn test_append_is_monotonic() -> anyhow::Result<()> {
        let mut bus = MockBus::open("mock0")?;
        let ids = [0x100u32, 0x200, 0x7E8];
        let probe: Vec<CanId> = (0..0x800u16).filter_map(CanId::standard).collect();
        let mut prev: Vec<CanId> = Vec::new();
        for (n, id) in ids.iter().enumerate() {
            let table = FilterTable::append_to(&mut bus, *id)?;
            assert_eq!(table.len(), n + 1);
            let accepted: Vec<CanId> = probe.iter().copied().filter(|c| table.accepts(c)).collect();
            assert!(prev.iter().all(|c| accepted.contains(c)));
            prev = accepted;
        }
        assert_eq!(bus.filters().len(), 3);
        Ok(())
    }

    #[test]
    fn test_entries_keep_order_and_mask() -> anyhow::Result<()> {
        let mut bus = MockBus::open("mock0")?;
        FilterTable::append_to(&mut bus, 0x200)?;
        let table = FilterTable::append_to(&mut bus, 0x100)?;
        let ids: Vec<u32> = table.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0x200, 0x100]);
        assert!(table
            .entries()
            .iter()
            .all(|e| e.mask == FILTER_MASK && !e.extended));
        Ok(())
    }

    #[test]
    fn test_closed_bus_rejects_install() -> anyhow::Result<()> {
        let mut bus = MockBus::open("mock0")?;
        bus.shutdown()?;
        let err = FilterTable::append_to(&mut bus, 0x100).unwrap_err();
        assert!(matches!(err, ConnectionError::FilterInstallFailure(_)));
        Ok(())
    }
}
