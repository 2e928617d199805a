use core::fmt;
use time::OffsetDateTime;

/// Largest payload of a classic CAN frame.
pub const CAN_MAX_DLEN: usize = 8;
/// Largest payload of a CAN FD frame.
pub const CANFD_MAX_DLEN: usize = 64;

/// 11-bit or 29-bit CAN identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CanId {
    raw: u32,
    extended: bool,
}

impl CanId {
    pub fn standard(id11: u16) -> Option<Self> {
        if id11 <= 0x7FF {
            Some(Self {
                raw: id11 as u32,
                extended: false,
            })
        } else {
            None
        }
    }

    pub fn extended(id29: u32) -> Option<Self> {
        if id29 <= 0x1FFF_FFFF {
            Some(Self {
                raw: id29,
                extended: true,
            })
        } else {
            None
        }
    }

    /// Build an id from a raw arbitration value and a format flag.
    pub fn from_raw(raw: u32, extended: bool) -> Option<Self> {
        if extended {
            Self::extended(raw)
        } else {
            u16::try_from(raw).ok().and_then(Self::standard)
        }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }
    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{raw:08X}", raw = self.raw)
        } else {
            write!(f, "0x{raw:03X}", raw = self.raw)
        }
    }
}

/// A classic or flexible-data-rate CAN frame.
///
/// `len` is always the number of meaningful bytes in `data`; use
/// [`CanFrame::data`] to get them as a slice.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanFrame {
    pub id: CanId,
    pub len: u8,
    pub data: [u8; CANFD_MAX_DLEN],
    /// Flexible data rate frame
    pub fd: bool,
    /// Bit rate switch for the data phase (FD only)
    pub brs: bool,
    pub rtr: bool,
    pub timestamp: Option<Timestamp>,
}

impl CanFrame {
    /// Classic data frame, at most 8 bytes.
    pub fn new(id: CanId, data: &[u8]) -> Option<Self> {
        if data.len() > CAN_MAX_DLEN {
            return None;
        }
        Self::with_payload(id, data, false)
    }

    /// FD data frame, at most 64 bytes.
    pub fn new_fd(id: CanId, data: &[u8]) -> Option<Self> {
        if data.len() > CANFD_MAX_DLEN {
            return None;
        }
        Self::with_payload(id, data, true)
    }

    fn with_payload(id: CanId, data: &[u8], fd: bool) -> Option<Self> {
        let mut buf = [0u8; CANFD_MAX_DLEN];
        buf.get_mut(..data.len())?.copy_from_slice(data);
        Some(Self {
            id,
            len: u8::try_from(data.len()).ok()?,
            data: buf,
            fd,
            brs: false,
            rtr: false,
            timestamp: None,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len).min(CANFD_MAX_DLEN)]
    }

    pub fn stamp_now(mut self) -> Self {
        self.timestamp = Some(Timestamp(OffsetDateTime::now_utc()));
        self
    }
}

/// Acceptance rule: a frame passes when `frame_id & mask == id & mask` and
/// its id format matches `extended`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CanFilter {
    pub id: u32,
    pub mask: u32,
    pub extended: bool,
}

impl CanFilter {
    pub fn new(id: u32, mask: u32, extended: bool) -> Self {
        Self { id, mask, extended }
    }

    pub fn matches(&self, id: &CanId) -> bool {
        id.is_extended() == self.extended && (id.raw() & self.mask) == (self.id & self.mask)
    }
}

/// True when `id` passes `filters`. An empty list accepts everything, the
/// same as a socket with no filters installed.
pub fn accepts(filters: &[CanFilter], id: &CanId) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(id))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timestamp(pub OffsetDateTime);

#[derive(Clone, Debug)]
pub struct BusInfo {
    pub name: String,
    pub driver: String,
}
