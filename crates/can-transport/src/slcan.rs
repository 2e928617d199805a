use crate::types::accepts;
use crate::{BusInfo, CanBus, CanFilter, CanFrame, CanId, Result, TransportError};
use serialport::{SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Payload sizes addressable by the 4-bit FD DLC code.
const FD_LENGTHS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// Read slice used while `recv` blocks without a deadline.
const IDLE_READ: Duration = Duration::from_millis(200);

/// Byte stream an SLCAN adapter is reached through.
pub(crate) trait SlcanPort: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
    fn discard_input(&mut self) -> io::Result<()>;
}

impl SlcanPort for Box<dyn SerialPort> {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout)
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

/// SLCAN text protocol over serial (common on macOS USB-CAN dongles).
///
/// FD records use the `d`/`D` (no bit rate switch) and `b`/`B` (with bit
/// rate switch) commands understood by CANable-style firmware. SLCAN has no
/// portable acceptance filter command, so filters are evaluated here.
pub struct SlcanBus {
    port_path: String,
    port: Box<dyn SlcanPort>,
    pending: Vec<u8>,
    filters: Vec<CanFilter>,
    open: bool,
}

impl SlcanBus {
    pub fn open_with(path: &str, bitrate: Option<SlcanBitrate>) -> Result<Self> {
        let port = serialport::new(path, 115200)
            .timeout(IDLE_READ)
            .open()
            .map_err(|e| open_error(path, e))?;
        let mut bus = Self::with_port(path, Box::new(port));
        // Close, set bitrate (default S6 = 500k), then open
        let _ = bus.command(b"C\r");
        let code = bitrate.unwrap_or(SlcanBitrate::B500k).code();
        bus.command(&[b'S', code, b'\r'])?;
        bus.command(b"O\r")?;
        tracing::info!(port = path, "slcan channel opened");
        Ok(bus)
    }

    pub(crate) fn with_port(path: &str, port: Box<dyn SlcanPort>) -> Self {
        SlcanBus {
            port_path: path.to_string(),
            port,
            pending: Vec::with_capacity(256),
            filters: Vec::new(),
            open: true,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn encode_frame(frame: &CanFrame) -> Result<Vec<u8>> {
        if frame.rtr && frame.fd {
            return Err(TransportError::InvalidFrame("remote FD frame"));
        }
        let len = usize::from(frame.len);
        let (dlc, padded) = if frame.fd {
            let code = FD_LENGTHS
                .iter()
                .position(|&l| l >= len)
                .ok_or(TransportError::InvalidFrame("dlc > 64"))?;
            (code, FD_LENGTHS[code])
        } else {
            if len > 8 {
                return Err(TransportError::InvalidFrame("dlc > 8"));
            }
            (len, len)
        };
        let ext = frame.id.is_extended();
        let kind = match (frame.fd, frame.brs, frame.rtr, ext) {
            (true, true, _, false) => b'b',
            (true, true, _, true) => b'B',
            (true, false, _, false) => b'd',
            (true, false, _, true) => b'D',
            (false, _, true, false) => b'r',
            (false, _, true, true) => b'R',
            (false, _, false, false) => b't',
            (false, _, false, true) => b'T',
        };
        let mut out = Vec::with_capacity(2 + 8 + 1 + padded * 2);
        out.push(kind);
        let id = if ext {
            format!("{:08X}", frame.id.raw())
        } else {
            format!("{:03X}", frame.id.raw())
        };
        out.extend_from_slice(id.as_bytes());
        out.extend_from_slice(format!("{dlc:X}").as_bytes());
        if !frame.rtr {
            for i in 0..padded {
                let b = if i < len { frame.data[i] } else { 0 };
                out.extend_from_slice(format!("{b:02X}").as_bytes());
            }
        }
        out.push(b'\r');
        Ok(out)
    }

    fn parse_frame(line: &[u8]) -> Result<CanFrame> {
        let (&kind, rest) = line
            .split_first()
            .ok_or(TransportError::InvalidFrame("empty"))?;
        let (ext, fd, brs, rtr) = match kind {
            b't' => (false, false, false, false),
            b'T' => (true, false, false, false),
            b'r' => (false, false, false, true),
            b'R' => (true, false, false, true),
            b'd' => (false, true, false, false),
            b'D' => (true, true, false, false),
            b'b' => (false, true, true, false),
            b'B' => (true, true, true, false),
            _ => return Err(TransportError::InvalidFrame("unknown header")),
        };
        let id_len = if ext { 8 } else { 3 };
        if rest.len() < id_len + 1 {
            return Err(TransportError::InvalidFrame("short header"));
        }
        let raw = u32::from_str_radix(hex_str(&rest[..id_len])?, 16)
            .map_err(|_| TransportError::InvalidFrame("id"))?;
        let id = CanId::from_raw(raw, ext).ok_or(TransportError::InvalidFrame("id range"))?;
        let code = usize::from_str_radix(hex_str(&rest[id_len..=id_len])?, 16)
            .map_err(|_| TransportError::InvalidFrame("dlc"))?;
        let len = if fd {
            FD_LENGTHS[code]
        } else {
            // Classic DLC codes 9..15 still mean 8 bytes
            code.min(8)
        };

        let mut data = Vec::with_capacity(len);
        if !rtr {
            let body = &rest[id_len + 1..];
            if body.len() < len * 2 {
                return Err(TransportError::InvalidFrame("short data"));
            }
            for pair in body.chunks_exact(2).take(len) {
                let byte = u8::from_str_radix(hex_str(pair)?, 16)
                    .map_err(|_| TransportError::InvalidFrame("byte"))?;
                data.push(byte);
            }
        }

        let mut frame = if fd {
            CanFrame::new_fd(id, &data)
        } else {
            CanFrame::new(id, &data)
        }
        .ok_or(TransportError::InvalidFrame("len"))?;
        frame.brs = brs;
        if rtr {
            frame.rtr = true;
            frame.len = len as u8;
        }
        Ok(frame.stamp_now())
    }

    fn command(&mut self, cmd: &[u8]) -> Result<()> {
        self.port
            .write_all(cmd)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    /// Pull the next `\r`-terminated record out of the pending buffer.
    fn next_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.pending.iter().position(|&b| b == b'\r')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        Some(line)
    }
}

fn open_error(path: &str, e: serialport::Error) -> TransportError {
    match e.kind() {
        serialport::ErrorKind::NoDevice
        | serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
            TransportError::InterfaceNotFound(path.to_string())
        }
        _ => TransportError::Io(e.to_string()),
    }
}

fn hex_str(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|_| TransportError::InvalidFrame("utf8"))
}

impl CanBus for SlcanBus {
    fn open(path: &str) -> Result<Self>
    where
        Self: Sized,
    {
        Self::open_with(path, Some(SlcanBitrate::B500k))
    }

    fn list() -> Result<Vec<BusInfo>> {
        let ports = serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|p| {
                let driver = match p.port_type {
                    SerialPortType::UsbPort(_) => "slcan-serial",
                    _ => "serial",
                };
                BusInfo {
                    name: p.port_name,
                    driver: driver.to_string(),
                }
            })
            .collect())
    }

    fn filters(&self) -> Vec<CanFilter> {
        self.filters.clone()
    }

    fn set_filters(&mut self, filters: &[CanFilter]) -> Result<()> {
        self.ensure_open()?;
        self.filters = filters.to_vec();
        Ok(())
    }

    /// `timeout_ms` bounds the whole call, including time spent discarding
    /// records the filters reject. `None` blocks until a frame is accepted.
    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame> {
        self.ensure_open()?;
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut buf = [0u8; 256];
        loop {
            while let Some(line) = self.next_line() {
                // Empty records are command acks (`\r`); `\x07` is a NACK
                if line.is_empty() || line == [0x07] {
                    continue;
                }
                match Self::parse_frame(&line) {
                    Ok(frame) if accepts(&self.filters, &frame.id) => return Ok(frame),
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(port = %self.port_path, error = %e, "skipping slcan record");
                    }
                }
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    deadline - now
                }
                None => IDLE_READ,
            };
            self.port
                .set_read_timeout(slice)
                .map_err(|e| TransportError::Io(e.to_string()))?;
            match self.port.read(&mut buf) {
                Ok(n) if n > 0 => self.pending.extend_from_slice(&buf[..n]),
                Ok(_) => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        self.ensure_open()?;
        let line = Self::encode_frame(frame)?;
        self.port
            .write_all(&line)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.pending.clear();
        self.command(b"C\r")?;
        self.command(b"O\r")?;
        self.port
            .discard_input()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.pending.clear();
        self.command(b"C\r")?;
        tracing::info!(port = %self.port_path, "slcan channel closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Supported SLCAN bitrates (mapped to Sx codes)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlcanBitrate {
    B10k,  // S0
    B20k,  // S1
    B50k,  // S2
    B100k, // S3
    B125k, // S4
    B250k, // S5
    B500k, // S6
    B800k, // S7
    B1M,   // S8
}

impl SlcanBitrate {
    pub fn code(self) -> u8 {
        match self {
            SlcanBitrate::B10k => b'0',
            SlcanBitrate::B20k => b'1',
            SlcanBitrate::B50k => b'2',
            SlcanBitrate::B100k => b'3',
            SlcanBitrate::B125k => b'4',
            SlcanBitrate::B250k => b'5',
            SlcanBitrate::B500k => b'6',
            SlcanBitrate::B800k => b'7',
            SlcanBitrate::B1M => b'8',
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_classic_standard() {
        let f = CanFrame::new(CanId::standard(0x123).unwrap(), &[0xDE, 0xAD]).unwrap();
        assert_eq!(SlcanBus::encode_frame(&f).unwrap(), b"t1232DEAD\r".to_vec());
    }

    #[test]
    fn test_encode_fd_pads_to_dlc() {
        let mut f = CanFrame::new_fd(CanId::extended(0x18DA_F110).unwrap(), &[0x11; 10]).unwrap();
        f.brs = true;
        let line = SlcanBus::encode_frame(&f).unwrap();
        assert_eq!(&line[..10], b"B18DAF1109");
        // 12 bytes on the wire, two hex chars each, plus terminator
        assert_eq!(line.len(), 10 + 24 + 1);
        assert!(line.ends_with(b"0000\r"));
    }

    #[test]
    fn test_parse_fd_record() {
        let f = SlcanBus::parse_frame(b"d7E09112233445566778899AABBCC").unwrap();
        assert!(f.fd);
        assert!(!f.brs);
        assert_eq!(f.id.raw(), 0x7E0);
        assert_eq!(f.len, 12);
        assert_eq!(f.data()[11], 0xCC);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SlcanBus::parse_frame(b"").is_err());
        assert!(SlcanBus::parse_frame(b"x123").is_err());
        assert!(SlcanBus::parse_frame(b"t12").is_err());
        assert!(SlcanBus::parse_frame(b"t1232DE").is_err());
    }

    /// Serial stand-in that answers every read with the next canned chunk,
    /// repeating the last one forever.
    struct ScriptedPort {
        chunks: Vec<Vec<u8>>,
        next: usize,
    }

    impl ScriptedPort {
        fn new(chunks: &[&[u8]]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_vec()).collect(),
                next: 0,
            }
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let idx = self.next.min(self.chunks.len() - 1);
            self.next += 1;
            let chunk = &self.chunks[idx];
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SlcanPort for ScriptedPort {
        fn set_read_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }
        fn discard_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Times out on every read.
    struct SilentPort;

    impl Read for SilentPort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(1));
            Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
        }
    }

    impl Write for SilentPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SlcanPort for SilentPort {
        fn set_read_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }
        fn discard_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_recv_deadline_holds_under_filtered_traffic() {
        let mut bus = SlcanBus::with_port("fake", Box::new(ScriptedPort::new(&[b"t3001AA\r"])));
        bus.set_filters(&[CanFilter::new(0x100, 0xFFF, false)]).unwrap();
        let start = Instant::now();
        let res = bus.recv(Some(20));
        assert!(matches!(res, Err(TransportError::Timeout)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_recv_skips_rejected_and_joins_split_records() {
        let port = ScriptedPort::new(&[b"t3001AA\r\rt1", b"0020102\r", b""]);
        let mut bus = SlcanBus::with_port("fake", Box::new(port));
        bus.set_filters(&[CanFilter::new(0x100, 0xFFF, false)]).unwrap();
        let f = bus.recv(Some(1000)).unwrap();
        assert_eq!(f.id.raw(), 0x100);
        assert_eq!(f.data(), &[0x01, 0x02]);
    }

    #[test]
    fn test_recv_times_out_on_silent_port() {
        let mut bus = SlcanBus::with_port("fake", Box::new(SilentPort));
        assert!(matches!(bus.recv(Some(10)), Err(TransportError::Timeout)));
    }

    #[test]
    fn test_closed_bus_rejects_everything() {
        let mut bus = SlcanBus::with_port("fake", Box::new(ScriptedPort::new(&[b""])));
        bus.shutdown().unwrap();
        bus.shutdown().unwrap();
        assert!(!bus.is_open());
        assert!(matches!(bus.recv(Some(10)), Err(TransportError::Closed)));
        let f = CanFrame::new(CanId::standard(0x1).unwrap(), &[]).unwrap();
        assert!(matches!(bus.send(&f), Err(TransportError::Closed)));
    }

    #[test]
    fn test_missing_port_maps_to_interface_not_found() {
        let e = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(matches!(
            open_error("/dev/ttyACM9", e),
            TransportError::InterfaceNotFound(p) if p == "/dev/ttyACM9"
        ));
        let e = serialport::Error::new(serialport::ErrorKind::InvalidInput, "bad");
        assert!(matches!(open_error("x", e), TransportError::Io(_)));
    }
}
