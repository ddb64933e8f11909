// Persistence sinks
//
// The merge tick forwards every event of a device flagged `save_events` to
// the configured sink. `BatchingSink` bounds the number of unflushed
// records so storage latency stays off the merge path except once every
// `flush_every` events.

use crate::error::{HubError, HubResult};
use crate::event::DeviceEvent;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Consumer of finalized event records
pub trait EventSink: Send {
    fn add_event(&mut self, event: &DeviceEvent) -> HubResult<()>;
    fn flush(&mut self) -> HubResult<()>;
}

/// Flushes its inner sink at least every `flush_every` records
pub struct BatchingSink {
    inner: Box<dyn EventSink>,
    flush_every: usize,
    unflushed: usize,
    total_events: u64,
    total_flushes: u64,
}

impl BatchingSink {
    pub fn new(inner: Box<dyn EventSink>, flush_every: usize) -> Self {
        Self {
            inner,
            flush_every: flush_every.max(1),
            unflushed: 0,
            total_events: 0,
            total_flushes: 0,
        }
    }

    pub fn add_event(&mut self, event: &DeviceEvent) -> HubResult<()> {
        self.inner.add_event(event)?;
        self.unflushed += 1;
        self.total_events += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> HubResult<()> {
        self.inner.flush()?;
        self.unflushed = 0;
        self.total_flushes += 1;
        Ok(())
    }

    /// Final flush on shutdown.
    pub fn close(&mut self) -> HubResult<()> {
        if self.unflushed > 0 {
            self.flush()?;
        }
        tracing::info!(
            events = self.total_events,
            flushes = self.total_flushes,
            "Persistence sink closed"
        );
        Ok(())
    }

    pub fn unflushed(&self) -> usize {
        self.unflushed
    }

    pub fn total_events(&self) -> u64 {
        self.total_events
    }
}

/// Appends one JSON array per event to a file
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn open(path: impl AsRef<Path>) -> HubResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| persistence_error(&path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| persistence_error(&path, e))?;
        tracing::info!(path = %path.display(), "Opened event data file");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn persistence_error(path: &Path, err: impl std::fmt::Display) -> HubError {
    HubError::Persistence(format!("{}: {}", path.display(), err))
}

impl EventSink for JsonLinesSink {
    fn add_event(&mut self, event: &DeviceEvent) -> HubResult<()> {
        serde_json::to_writer(&mut self.writer, &event.to_tuple())
            .map_err(|e| persistence_error(&self.path, e))?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| persistence_error(&self.path, e))
    }

    fn flush(&mut self) -> HubResult<()> {
        self.writer
            .flush()
            .map_err(|e| persistence_error(&self.path, e))
    }
}

/// In-memory sink; clones share the same storage
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

#[derive(Default)]
struct MemorySinkState {
    pending: Vec<DeviceEvent>,
    flushed: Vec<DeviceEvent>,
    flushes: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events made durable by a flush so far.
    pub fn flushed_events(&self) -> Vec<DeviceEvent> {
        self.state.lock().flushed.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }
}

impl EventSink for MemorySink {
    fn add_event(&mut self, event: &DeviceEvent) -> HubResult<()> {
        self.state.lock().pending.push(event.clone());
        Ok(())
    }

    fn flush(&mut self) -> HubResult<()> {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        state.flushed.extend(pending);
        state.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NativeEvent;
    use crate::value::Value;

    fn event(id: u64) -> DeviceEvent {
        let mut native = NativeEvent::new(122, id as f64, vec![Value::from(id), Value::Float(0.5)]);
        native.event_id = id;
        DeviceEvent::from_native(native)
    }

    #[test]
    fn test_batching_flushes_every_n() {
        let memory = MemorySink::new();
        let mut sink = BatchingSink::new(Box::new(memory.clone()), 3);
        for id in 1..=7 {
            sink.add_event(&event(id)).unwrap();
        }
        assert_eq!(memory.flush_count(), 2);
        assert_eq!(memory.flushed_events().len(), 6);
        assert_eq!(memory.pending_len(), 1);
        assert_eq!(sink.unflushed(), 1);

        sink.close().unwrap();
        assert_eq!(memory.flushed_events().len(), 7);
        assert_eq!(sink.total_events(), 7);
    }

    #[test]
    fn test_json_lines_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("events.jsonl");
        let mut sink = BatchingSink::new(Box::new(JsonLinesSink::open(&path).unwrap()), 128);
        sink.add_event(&event(1)).unwrap();
        sink.add_event(&event(2)).unwrap();
        sink.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(DeviceEvent::from_tuple(&first).unwrap(), event(1));
    }
}
