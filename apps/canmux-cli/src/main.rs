use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use can_connection::{CanConnection, ConnectionConfig};
use can_transport as can;
use can_transport::CanBus;

#[derive(Parser, Debug)]
#[command(
    name = "canmux",
    version,
    about = "Share one CAN interface among several listeners",
    disable_help_subcommand = true
)]
struct Cli {
    /// Connection config (YAML)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Mock,
    Slcan,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available CAN interfaces
    List {
        #[arg(long, value_enum, default_value_t = Backend::Mock)]
        backend: Backend,
    },
    /// Receive frames through a shared connection with several listeners
    Monitor {
        #[arg(long, value_enum, default_value_t = Backend::Mock)]
        backend: Backend,
        /// Device name or serial port path
        #[arg(long, default_value = "mock0")]
        device: String,
        /// Acceptance filter ids (hex); the first one is installed at open
        #[arg(long = "filter", required = true, num_args = 1..)]
        filters: Vec<String>,
        /// Number of listeners to register
        #[arg(long, default_value_t = 1)]
        listeners: usize,
        /// Stop after this many frames
        #[arg(long, default_value_t = 10)]
        count: u32,
        /// Stop after this many seconds regardless of count
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Emit one JSON record per frame instead of text
        #[arg(long)]
        json: bool,
        #[arg(long, value_enum)]
        bitrate: Option<Bitrate>,
    },
    /// Transmit one FD frame
    Send {
        #[arg(long, value_enum, default_value_t = Backend::Mock)]
        backend: Backend,
        #[arg(long, default_value = "mock0")]
        device: String,
        /// Arbitration id (hex)
        #[arg(long)]
        id: String,
        /// Data bytes in hex (e.g., 02 10 03)
        #[arg(long, num_args = 0..)]
        data: Vec<String>,
        /// Use a 29-bit identifier
        #[arg(long)]
        extended: bool,
        #[arg(long, value_enum)]
        bitrate: Option<Bitrate>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Bitrate {
    B10k,
    B20k,
    B50k,
    B100k,
    B125k,
    B250k,
    B500k,
    B800k,
    B1M,
}

impl Bitrate {
    fn into_transport(self) -> can::SlcanBitrate {
        match self {
            Bitrate::B10k => can::SlcanBitrate::B10k,
            Bitrate::B20k => can::SlcanBitrate::B20k,
            Bitrate::B50k => can::SlcanBitrate::B50k,
            Bitrate::B100k => can::SlcanBitrate::B100k,
            Bitrate::B125k => can::SlcanBitrate::B125k,
            Bitrate::B250k => can::SlcanBitrate::B250k,
            Bitrate::B500k => can::SlcanBitrate::B500k,
            Bitrate::B800k => can::SlcanBitrate::B800k,
            Bitrate::B1M => can::SlcanBitrate::B1M,
        }
    }
}

struct MonitorArgs {
    filters: Vec<u32>,
    listeners: usize,
    count: u32,
    seconds: u64,
    json: bool,
}

#[derive(Serialize)]
struct FrameRecord {
    listener: usize,
    id: u32,
    extended: bool,
    fd: bool,
    len: u8,
    data: String,
    ts: Option<String>,
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => can_connection::load_config_file(path)?,
        None => ConnectionConfig::default(),
    };

    match cli.command {
        Commands::List { backend } => list_backend(backend),
        Commands::Monitor {
            backend,
            device,
            filters,
            listeners,
            count,
            seconds,
            json,
            bitrate,
        } => {
            let filters = filters
                .iter()
                .map(|s| parse_hex_u32(s))
                .collect::<Result<Vec<_>>>()?;
            let args = MonitorArgs {
                filters,
                listeners: listeners.max(1),
                count,
                seconds,
                json,
            };
            match backend {
                Backend::Mock => {
                    let bus = can::MockBus::open(&device)?;
                    let feeder = spawn_demo_feeder(bus.peer(), &args.filters);
                    let res = monitor(bus, &args, config);
                    let _ = feeder.join();
                    res
                }
                Backend::Slcan => {
                    let bus = can::SlcanBus::open_with(&device, bitrate.map(|b| b.into_transport()))?;
                    monitor(bus, &args, config)
                }
            }
        }
        Commands::Send {
            backend,
            device,
            id,
            data,
            extended,
            bitrate,
        } => {
            let id = parse_hex_u32(&id)?;
            let bytes = parse_hex_bytes(&data)?;
            match backend {
                Backend::Mock => {
                    let bus = can::MockBus::open(&device)?;
                    let peer = bus.peer();
                    send_once(bus, id, &bytes, extended, config)?;
                    for f in peer.sent() {
                        print_frame(0, &f);
                    }
                    Ok(())
                }
                Backend::Slcan => {
                    let bus = can::SlcanBus::open_with(&device, bitrate.map(|b| b.into_transport()))?;
                    send_once(bus, id, &bytes, extended, config)
                }
            }
        }
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn list_backend(backend: Backend) -> Result<()> {
    let buses = match backend {
        Backend::Mock => can::MockBus::list()?,
        Backend::Slcan => can::SlcanBus::list()?,
    };
    for bus in buses {
        println!("{}\t{}", bus.name, bus.driver);
    }
    Ok(())
}

fn monitor<B: CanBus + 'static>(bus: B, args: &MonitorArgs, config: ConnectionConfig) -> Result<()> {
    let Some((&first, rest)) = args.filters.split_first() else {
        anyhow::bail!("at least one filter is required");
    };
    let (tx, rx) = mpsc::channel::<()>();
    let conn = CanConnection::new(listener(0, args.json, tx.clone()), first, bus, config)?;
    for n in 1..args.listeners {
        conn.add_callback(listener(n, args.json, tx.clone()))?;
    }
    for &f in rest {
        conn.add_filter(f)?;
    }
    drop(tx);
    info!(
        listeners = conn.listener_count(),
        filters = conn.filters().len(),
        "monitoring"
    );

    // every listener reports each frame; count frames, not deliveries
    let start = Instant::now();
    let limit = Duration::from_secs(args.seconds);
    let mut deliveries = 0usize;
    let wanted = deliveries_wanted(args.count, args.listeners);
    while deliveries < wanted {
        let left = limit.saturating_sub(start.elapsed());
        if left.is_zero() {
            warn!("time limit reached");
            break;
        }
        match rx.recv_timeout(left) {
            Ok(()) => deliveries += 1,
            Err(_) => break,
        }
    }

    conn.shutdown();
    let stats = conn.stats();
    eprintln!(
        "frames={} faults={} recv_errors={}",
        stats.frames_dispatched, stats.listener_faults, stats.recv_errors
    );
    Ok(())
}

fn deliveries_wanted(count: u32, listeners: usize) -> usize {
    usize::try_from(count)
        .unwrap_or(usize::MAX)
        .saturating_mul(listeners)
}

fn listener(
    n: usize,
    json: bool,
    tx: mpsc::Sender<()>,
) -> impl Fn(&can::CanFrame) + Send + Sync + 'static {
    let tx = Mutex::new(tx);
    move |f: &can::CanFrame| {
        if json {
            println!("{}", record_line(n, f));
        } else {
            print_frame(n, f);
        }
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(());
        }
    }
}

fn send_once<B: CanBus + 'static>(
    bus: B,
    id: u32,
    data: &[u8],
    extended: bool,
    config: ConnectionConfig,
) -> Result<()> {
    let conn = CanConnection::new(|_: &can::CanFrame| {}, id, bus, config)?;
    conn.transmit(data, id, extended)?;
    println!("send: ok ({} bytes)", data.len());
    conn.shutdown();
    Ok(())
}

/// Pushes one frame per filter plus one that no filter admits.
fn spawn_demo_feeder(peer: can::MockPeer, filters: &[u32]) -> thread::JoinHandle<()> {
    let ids: Vec<u32> = filters.to_vec();
    thread::spawn(move || {
        for round in 0u8..5 {
            thread::sleep(Duration::from_millis(100));
            for &id in ids.iter().chain(std::iter::once(&0x7FF)) {
                let frame = can::CanId::from_raw(id, id > 0x7FF)
                    .and_then(|cid| can::CanFrame::new_fd(cid, &[round, 0xCA, 0xFE]));
                if let Some(frame) = frame {
                    if !peer.inject(frame) {
                        return;
                    }
                }
            }
        }
    })
}

fn parse_hex_u32(s: &str) -> Result<u32> {
    let t = s.trim();
    let no_prefix = t.strip_prefix("0x").unwrap_or(t);
    u32::from_str_radix(no_prefix, 16).map_err(|e| anyhow::anyhow!("invalid hex id '{t}': {e}"))
}

fn parse_hex_bytes(items: &[String]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(items.len());
    for s in items {
        let t = s.trim();
        let no_prefix = t.strip_prefix("0x").unwrap_or(t);
        let b = u8::from_str_radix(no_prefix, 16)
            .map_err(|e| anyhow::anyhow!("invalid hex byte '{t}': {e}"))?;
        out.push(b);
    }
    Ok(out)
}

fn data_hex(f: &can::CanFrame, sep: &str) -> String {
    f.data()
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(sep)
}

fn timestamp(f: &can::CanFrame) -> Option<String> {
    f.timestamp.and_then(|t| {
        t.0.format(&time::format_description::well_known::Rfc3339)
            .ok()
    })
}

fn print_frame(n: usize, f: &can::CanFrame) {
    println!(
        "[{n}] {id}\t{kind}\tlen={len}\t{data}\t{ts}",
        id = f.id,
        kind = if f.fd { "fd" } else { "cc" },
        len = f.len,
        data = data_hex(f, " "),
        ts = timestamp(f).unwrap_or_default()
    );
}

fn record_line(n: usize, f: &can::CanFrame) -> String {
    let rec = FrameRecord {
        listener: n,
        id: f.id.raw(),
        extended: f.id.is_extended(),
        fd: f.fd,
        len: f.len,
        data: data_hex(f, ""),
        ts: timestamp(f),
    };
    serde_json::to_string(&rec).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliveries_wanted_saturates() {
        assert_eq!(deliveries_wanted(10, 3), 30);
        assert_eq!(deliveries_wanted(u32::MAX, usize::MAX), usize::MAX);
    }

    #[test]
    fn test_parse_hex_inputs() {
        assert_eq!(parse_hex_u32("0x7E0").unwrap(), 0x7E0);
        assert_eq!(parse_hex_u32("18DAF110").unwrap(), 0x18DA_F110);
        assert!(parse_hex_u32("zz").is_err());
        let bytes = parse_hex_bytes(&["02".to_string(), "0x10".to_string()]).unwrap();
        assert_eq!(bytes, vec![0x02, 0x10]);
    }
}
