//! can-connection: share one CAN bus handle among several consumers
//!
//! A [`CanConnection`] aggregates the acceptance filters its users ask for into
//! a single table installed on the bus, fans every accepted inbound frame out
//! to all registered listeners from one background thread, and forwards
//! transmissions straight to the bus. Whether the connection closes the bus on
//! shutdown depends on [`BusOwnership`], fixed at construction.

mod error;
pub use error::{ConnectionError, Result};

mod config;
pub use config::{load_config_file, ConnectionConfig};

mod filter;
pub use filter::{FilterEntry, FilterTable, FILTER_MASK};

mod listener;
pub use listener::{Callback, Listener, ListenerId, ListenerRegistry};

mod dispatch;
pub use dispatch::{DispatchState, DispatchStats};

mod connection;
pub use connection::{BusOwnership, CanConnection, SharedBus};
