//! Five independent append-only JSONL writers (C11, §4.11), one per event
//! kind: `decision`, `order`, `tracer`, `audit`, `health`.
//!
//! Grounded on the teacher's `AsyncJournal` (`execution/journal.rs`): a
//! bounded channel feeding a dedicated writer thread, `try_send` so a full
//! buffer drops events rather than stalling the engine. Generalized here
//! with daily UTC rotation and gzip-on-rotate (AS.7).

use crossbeam::channel::{bounded, Sender};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

const CHANNEL_CAPACITY: usize = 4096;

/// Mandatory envelope every telemetry record carries (§4.11).
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub ts_ns: u128,
    pub level: String,
    pub component: String,
    pub event: String,
    pub message: String,
    pub session_id: Option<String>,
    pub decision_id: Option<String>,
    pub order_req_id: Option<String>,
    pub client_order_id: Option<String>,
    pub exchange_order_id: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Value,
}

impl Envelope {
    pub fn new(component: &str, event: &str, message: impl Into<String>, fields: serde_json::Value) -> Self {
        let ctx = crate::telemetry::trace::current();
        Self {
            ts_ns: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos(),
            level: "info".to_string(),
            component: component.to_string(),
            event: event.to_string(),
            message: message.into(),
            session_id: ctx.session_id,
            decision_id: ctx.decision_id,
            order_req_id: ctx.order_req_id,
            client_order_id: None,
            exchange_order_id: None,
            fields,
        }
    }
}

/// Converts days-since-epoch (Howard Hinnant's `civil_from_days`) into a
/// `YYYY-MM-DD` string, avoiding a chrono dependency for one rotation check.
fn date_string_for_days(days_since_epoch: i64) -> String {
    let z = days_since_epoch + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!("{y:04}-{m:02}-{d:02}")
}

fn today_utc() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    date_string_for_days((secs / 86_400) as i64)
}

struct RotatingFile {
    path: PathBuf,
    file: File,
    open_date: String,
}

impl RotatingFile {
    fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            open_date: today_utc(),
        })
    }

    fn rotate_if_needed(&mut self) {
        let today = today_utc();
        if today == self.open_date {
            return;
        }
        let rotated = self.path.with_extension(format!("{}.jsonl", self.open_date));
        if std::fs::rename(&self.path, &rotated).is_ok() {
            gzip_in_place(&rotated);
        }
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(f) => {
                self.file = f;
                self.open_date = today;
            }
            Err(e) => warn!(error = %e, path = ?self.path, "telemetry_rotate_reopen_failed"),
        }
    }

    fn write_line(&mut self, line: &str) {
        self.rotate_if_needed();
        if let Err(e) = writeln!(self.file, "{line}") {
            warn!(error = %e, path = ?self.path, "telemetry_write_failed");
        }
    }
}

fn gzip_in_place(path: &Path) {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    let Ok(data) = std::fs::read(path) else { return };
    let gz_path = path.with_extension(format!(
        "{}.gz",
        path.extension().and_then(|e| e.to_str()).unwrap_or("jsonl")
    ));
    let Ok(out) = File::create(&gz_path) else { return };
    let mut encoder = GzEncoder::new(out, Compression::default());
    if encoder.write_all(&data).is_ok() && encoder.finish().is_ok() {
        let _ = std::fs::remove_file(path);
    }
}

/// One JSONL writer backed by a dedicated thread. Dropping everyone's
/// handle closes the channel, which ends the thread after it drains.
pub struct EventWriter {
    sender: Option<Sender<String>>,
    thread: Option<JoinHandle<()>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let mut rotating = RotatingFile::open(path)?;
        let (sender, receiver) = bounded::<String>(CHANNEL_CAPACITY);
        let thread = std::thread::Builder::new()
            .name("telemetry-writer".into())
            .spawn(move || {
                while let Ok(line) = receiver.recv() {
                    rotating.write_line(&line);
                }
            })
            .expect("spawn telemetry writer thread");
        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    /// Records one envelope. Dropping events under backpressure is
    /// preferable to stalling the engine.
    pub fn record(&self, envelope: &Envelope) {
        let Some(sender) = &self.sender else { return };
        match serde_json::to_string(envelope) {
            Ok(line) => {
                if sender.try_send(line).is_err() {
                    warn!("telemetry_buffer_full_dropping_event");
                }
            }
            Err(e) => warn!(error = %e, "telemetry_serialize_failed"),
        }
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
