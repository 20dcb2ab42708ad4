//! JSON-lines log file written from a background thread.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::{
    io::{BufWriter, Write},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, SyncSender, TrySendError},
    },
    thread::JoinHandle,
    time::Instant,
};
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing_subscriber::Layer;

/// Capacity of the channel between the layer and the writer thread.
pub const LOG_BUFFER: usize = 10_000;

/// One event as written to the file; event fields sit next to the fixed keys.
#[derive(Debug, Serialize)]
pub struct LogLine {
    pub elapsed_ms: u64,
    pub level: &'static str,
    pub target: &'static str,
    pub message: String,
    #[serde(flatten)]
    pub fields: JsonMap<String, JsonValue>,
}

#[derive(Default)]
struct EventFields {
    message: String,
    fields: JsonMap<String, JsonValue>,
}

impl Visit for EventFields {
    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{value:?}").into());
        }
    }
}

/// Counters reported when the writer is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonLogCounts {
    pub written: u64,
    pub dropped: u64,
}

/// Writes records on a dedicated thread. Records arriving while the channel
/// is full are dropped and counted.
#[derive(Debug)]
pub struct JsonLogWriter {
    started_at: Instant,
    sender: Mutex<Option<SyncSender<LogLine>>>,
    handle: Mutex<Option<JoinHandle<eyre::Result<()>>>>,
    written: AtomicU64,
    dropped: AtomicU64,
}

impl JsonLogWriter {
    pub fn new(path: &Path, capacity: usize) -> eyre::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let mut out = BufWriter::new(file);
        let (tx, rx) = mpsc::sync_channel::<LogLine>(capacity);
        let handle = std::thread::Builder::new()
            .name("json-log".to_string())
            .spawn(move || -> eyre::Result<()> {
                for line in rx {
                    serde_json::to_writer(&mut out, &line)?;
                    out.write_all(b"\n")?;
                }
                out.flush()?;
                Ok(())
            })?;

        Ok(Self {
            started_at: Instant::now(),
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn record(&self, line: LogLine) {
        let sender = self.sender.lock().as_ref().cloned();
        let Some(sender) = sender else {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return;
        };
        match sender.try_send(line) {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::SeqCst);
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Closes the channel and waits for the thread to flush the file.
    pub fn finish(&self) -> eyre::Result<JsonLogCounts> {
        drop(self.sender.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => return Err(eyre::eyre!("json log writer thread panicked")),
            }
        }
        Ok(self.counts())
    }

    pub fn counts(&self) -> JsonLogCounts {
        JsonLogCounts {
            written: self.written.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Tracing layer that forwards every event it sees to a [`JsonLogWriter`].
#[derive(Clone)]
pub struct JsonLogLayer {
    writer: std::sync::Arc<JsonLogWriter>,
}

impl JsonLogLayer {
    pub fn new(writer: std::sync::Arc<JsonLogWriter>) -> Self {
        Self { writer }
    }
}

impl<S> Layer<S> for JsonLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = EventFields::default();
        event.record(&mut visitor);
        self.writer.record(LogLine {
            elapsed_ms: self.writer.elapsed_ms(),
            level: meta.level().as_str(),
            target: meta.target(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}
