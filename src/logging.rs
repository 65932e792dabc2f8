//! Application + access logging, grounded on the teacher's custom
//! `log::Log` implementation. Kept as a plain `log` facade (rather than
//! switching to `tracing`) because that is the ambient logging stack the
//! teacher repo already carries.

use log::{LevelFilter, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};

// time crate has no strftime; see https://github.com/time-rs/time/issues/341
const CLF_TIME_FORMAT: &[FormatItem] = format_description!(
    "[day]/[month repr:short]/[year]:[hour]:[minute]:[second] [offset_hour sign:mandatory][offset_minute]"
);

/// Per-request access-log accumulator, emitted once in Common Log Format
/// with an added request-id and timing field.
#[derive(Clone)]
pub struct LoggingCtx {
    addr: SocketAddr,
    request_id: String,
    method: Option<String>,
    path: Option<String>,
    version: Option<String>,
    status: Option<u16>,
    resp_size: Option<u64>,
    start: Option<OffsetDateTime>,
    end: Option<OffsetDateTime>,
}

pub fn log_context(remote: SocketAddr, request_id: String) -> LoggingCtx {
    LoggingCtx {
        addr: remote,
        request_id,
        method: None,
        path: None,
        version: None,
        status: None,
        resp_size: None,
        start: None,
        end: None,
    }
}

impl LoggingCtx {
    pub fn start(&mut self) -> &mut Self {
        self.start = Some(OffsetDateTime::now_utc());
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.end = Some(OffsetDateTime::now_utc());
        self
    }

    pub fn request(&mut self, method: &http::Method, uri: &http::Uri, version: http::Version) -> &mut Self {
        self.method = Some(method.to_string());
        self.path = Some(uri.path().to_string());
        self.version = Some(format!("{version:?}"));
        self
    }

    pub fn response(&mut self, status: http::StatusCode, size: Option<u64>) -> &mut Self {
        self.status = Some(status.as_u16());
        self.resp_size = size;
        self
    }

    fn render(&self) -> String {
        let start = self.start.unwrap_or_else(OffsetDateTime::now_utc);
        let end = self.end.unwrap_or_else(OffsetDateTime::now_utc);
        let elapsed = (end - start).whole_microseconds();
        let time = end.format(CLF_TIME_FORMAT).unwrap_or_else(|_| "-".to_string());
        format!(
            r#"{} - - [{}] "{} {} {}" {} {} {}us reqid={}"#,
            self.addr,
            time,
            self.method.as_deref().unwrap_or("-"),
            self.path.as_deref().unwrap_or("-"),
            self.version.as_deref().unwrap_or("-"),
            self.status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            self.resp_size.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            elapsed,
            self.request_id,
        )
    }

    /// Emits the accumulated line at info level.
    pub fn emit(&self) {
        log::info!("{}", self.render());
    }
}

/// Either stdout (the common case) or a single opened `-logfile` handle.
enum Sink {
    Stdout,
    File(Mutex<File>),
}

struct LineLogger {
    sink: Sink,
}

impl log::Log for LineLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[{}] {}", record.level(), record.args());
        match &self.sink {
            Sink::Stdout => println!("{line}"),
            Sink::File(f) => {
                if let Ok(mut f) = f.lock() {
                    let _ = writeln!(f, "{line}");
                }
            }
        }
    }

    fn flush(&self) {
        if let Sink::File(f) = &self.sink {
            if let Ok(mut f) = f.lock() {
                let _ = f.flush();
            }
        }
    }
}

static LOGGER_STDOUT: LineLogger = LineLogger { sink: Sink::Stdout };

/// Installs the process-wide logger writing to stdout. `-verbose`/`-debug`
/// map to Info/Debug upstream of this call (see `cli::Cli`); flag parsing
/// itself is an external collaborator (spec §1).
pub fn init(level: LevelFilter) {
    log::set_logger(&LOGGER_STDOUT)
        .map(|_| log::set_max_level(level))
        .unwrap_or_else(|_| eprintln!("failed to init logging"));
}

/// Installs the process-wide logger, redirecting to `logfile` when given
/// (spec §6's `-logfile` flag). Falls back to stdout (and logs a warning)
/// if the file can't be opened.
pub fn init_with_target(level: LevelFilter, logfile: Option<&Path>) {
    let Some(path) = logfile else {
        return init(level);
    };
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            let logger: &'static LineLogger = Box::leak(Box::new(LineLogger { sink: Sink::File(Mutex::new(file)) }));
            log::set_logger(logger)
                .map(|_| log::set_max_level(level))
                .unwrap_or_else(|_| eprintln!("failed to init logging"));
        }
        Err(e) => {
            init(level);
            log::warn!("failed to open -logfile {}: {e}, logging to stdout instead", path.display());
        }
    }
}
