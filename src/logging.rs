//! Log sinks. Interactive runs log to stderr; runs from cron usually want the
//! local syslog daemon instead.

use std::io::{self, Write};
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::Arc;

use tracing::{warn, Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const SYSLOG_SOCKET: &str = "/dev/log";

const FACILITY_USER: u8 = 1;

/// Install the global subscriber. `RUST_LOG` overrides `level`, and
/// `verbose` overrides both.
pub fn init(level: &str, verbose: bool, syslog: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    if !syslog {
        // stdout carries dry-run output
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(false)
            .init();
        return;
    }

    match Syslog::connect(Path::new(SYSLOG_SOCKET), env!("CARGO_PKG_NAME")) {
        Ok(sink) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(sink)
            .with_ansi(false)
            .without_time()
            .with_level(false)
            .with_target(false)
            .init(),
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .with_target(false)
                .init();
            warn!(socket = SYSLOG_SOCKET, error = %e, "Syslog unavailable, logging to stderr");
        }
    }
}

/// Datagram connection to a local syslog socket. Every event becomes one
/// RFC 3164 style message with facility `user`.
#[derive(Debug, Clone)]
pub struct Syslog {
    socket: Arc<UnixDatagram>,
    tag: String,
}

impl Syslog {
    pub fn connect(path: &Path, ident: &str) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;
        Ok(Self {
            socket: Arc::new(socket),
            tag: format!("{ident}[{}]", std::process::id()),
        })
    }

    fn record(&self, level: &Level) -> SyslogRecord {
        SyslogRecord {
            sink: self.clone(),
            priority: priority(level),
            buf: Vec::new(),
        }
    }
}

impl<'a> MakeWriter<'a> for Syslog {
    type Writer = SyslogRecord;

    fn make_writer(&'a self) -> SyslogRecord {
        self.record(&Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> SyslogRecord {
        self.record(meta.level())
    }
}

/// Collects one formatted event and sends it when dropped.
pub struct SyslogRecord {
    sink: Syslog,
    priority: u8,
    buf: Vec<u8>,
}

impl Write for SyslogRecord {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogRecord {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buf);
        let message = text.trim_end();
        if message.is_empty() {
            return;
        }
        let datagram = format!("<{}>{}: {message}", self.priority, self.sink.tag);
        // Nowhere left to report a lost log line.
        let _ = self.sink.socket.send(datagram.as_bytes());
    }
}

fn priority(level: &Level) -> u8 {
    let severity = match *level {
        Level::ERROR => 3,
        Level::WARN => 4,
        Level::INFO => 6,
        _ => 7,
    };
    FACILITY_USER * 8 + severity
}
