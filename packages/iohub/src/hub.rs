// Event hub
//
// Owns the devices, their native queues, the global time-ordered buffer and
// the optional persistence sink. Pollers push into device queues through
// `poll_device`; the merge tick drains every queue, converts each event to
// its canonical record, notifies listeners, inserts it into the buffer by
// hub_time and forwards it to the sink.

use crate::device::{
    create_device, device_type_of, log_levels, Device, DeviceInfo, DeviceKind, EventListener,
    ExperimentDevice, PollSink,
};
use crate::error::{HubError, HubResult};
use crate::event::{DeviceEvent, NativeEvent};
use crate::persistence::BatchingSink;
use crate::queue::{EventQueue, QueueMetrics};
use crate::record::CORE_EVENT_FIELDS;
use crate::schema::SchemaRegistry;
use crate::timebase::MonotonicClock;
use crate::value::Value;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Issues globally unique, strictly increasing event ids
#[derive(Debug)]
pub struct EventIdSource {
    next: AtomicU64,
}

impl EventIdSource {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Ids issued so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for EventIdSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for the global buffer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BufferMetrics {
    pub accepted: u64,
    pub evicted: u64,
    pub drained: u64,
    pub current_size: usize,
    pub peak_size: usize,
    pub capacity: usize,
}

/// Capacity-bounded buffer ordered by hub_time
#[derive(Debug)]
pub struct HubBuffer {
    events: VecDeque<DeviceEvent>,
    capacity: usize,
    metrics: BufferMetrics,
}

impl HubBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            metrics: BufferMetrics {
                capacity,
                ..BufferMetrics::default()
            },
        }
    }

    /// Insert after every event with an equal or earlier hub_time. When
    /// full, the earliest event is dropped: the buffered front, or the
    /// incoming event itself if it is earlier than everything buffered.
    pub fn insert(&mut self, event: DeviceEvent) -> Option<DeviceEvent> {
        let evicted = if self.events.len() >= self.capacity {
            self.metrics.evicted += 1;
            match self.events.front() {
                Some(front) if event.hub_time < front.hub_time => return Some(event),
                _ => self.events.pop_front(),
            }
        } else {
            None
        };
        self.place(event);
        self.metrics.accepted += 1;
        self.metrics.peak_size = self.metrics.peak_size.max(self.events.len());
        evicted
    }

    fn place(&mut self, event: DeviceEvent) {
        let at = self.events.partition_point(|e| e.hub_time <= event.hub_time);
        self.events.insert(at, event);
    }

    /// Remove and return up to `max` events, earliest first.
    pub fn drain(&mut self, max: Option<usize>) -> Vec<DeviceEvent> {
        let n = max.map_or(self.events.len(), |m| m.min(self.events.len()));
        let events: Vec<DeviceEvent> = self.events.drain(..n).collect();
        self.metrics.drained += events.len() as u64;
        events
    }

    /// Put back events taken by `drain` that could not be delivered.
    pub fn restore(&mut self, events: Vec<DeviceEvent>) {
        self.metrics.drained = self.metrics.drained.saturating_sub(events.len() as u64);
        for event in events {
            if self.events.len() >= self.capacity {
                // Restored events are the oldest in the system.
                self.metrics.evicted += 1;
                continue;
            }
            self.place(event);
        }
    }

    pub fn clear(&mut self) -> usize {
        let n = self.events.len();
        self.events.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn metrics(&self) -> BufferMetrics {
        BufferMetrics {
            current_size: self.events.len(),
            ..self.metrics.clone()
        }
    }
}

/// Per-device settings applied by the hub
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub event_buffer_length: usize,
    pub poll_interval: Option<Duration>,
    pub save_events: bool,
    pub stream_events: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            event_buffer_length: 1024,
            poll_interval: None,
            save_events: true,
            stream_events: true,
        }
    }
}

/// A device together with its queue and hub-side state
pub struct DeviceSlot {
    info: DeviceInfo,
    device: Mutex<Box<dyn Device>>,
    queue: EventQueue,
    options: DeviceOptions,
    reporting: AtomicBool,
    disabled: AtomicBool,
    last_poll: Mutex<Option<f64>>,
    listeners: Mutex<Vec<Arc<dyn EventListener>>>,
}

impl DeviceSlot {
    fn new(device: Box<dyn Device>, options: DeviceOptions) -> Self {
        Self {
            info: device.info().clone(),
            queue: EventQueue::new(options.event_buffer_length),
            device: Mutex::new(device),
            options,
            reporting: AtomicBool::new(true),
            disabled: AtomicBool::new(false),
            last_poll: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.options.poll_interval
    }

    pub fn is_reporting(&self) -> bool {
        self.reporting.load(Ordering::Relaxed)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Relaxed);
    }

    pub fn queue_metrics(&self) -> QueueMetrics {
        self.queue.metrics()
    }

    pub fn command_names(&self) -> Vec<&'static str> {
        self.device.lock().command_names()
    }

    /// Accept stamped native events: assign ids and enqueue, unless
    /// reporting is switched off.
    fn accept(&self, events: Vec<NativeEvent>, ids: &EventIdSource) -> usize {
        if !self.is_reporting() {
            return 0;
        }
        let n = events.len();
        for mut event in events {
            event.event_id = ids.next_id();
            if let Some(lost) = self.queue.push(event) {
                tracing::debug!(device = %self.info.name, event_id = lost.event_id, "Device queue full, evicted oldest");
            }
        }
        n
    }

    fn notify(&self, event: &DeviceEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(device = %self.info.name, event_id = event.event_id, error = %e, "Event listener failed")
                }
                Err(_) => {
                    tracing::error!(device = %self.info.name, event_id = event.event_id, "Event listener panicked")
                }
            }
        }
    }
}

/// Summary of one merge tick
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct MergeStats {
    pub merged: usize,
    pub rejected: usize,
    pub evicted: usize,
}

/// Central hub state shared by every task
pub struct EventHub {
    clock: MonotonicClock,
    schema: Arc<SchemaRegistry>,
    devices: Vec<Arc<DeviceSlot>>,
    by_name: HashMap<String, usize>,
    experiment: Option<usize>,
    buffer: Mutex<HubBuffer>,
    ids: EventIdSource,
    experiment_id: AtomicU32,
    session_id: AtomicU32,
    sink: Mutex<Option<BatchingSink>>,
    shutdown: CancellationToken,
}

/// Collects devices before the hub is started
pub struct EventHubBuilder {
    clock: MonotonicClock,
    schema: Option<SchemaRegistry>,
    buffer_capacity: usize,
    devices: Vec<(Box<dyn Device>, DeviceOptions)>,
    sink: Option<BatchingSink>,
}

impl EventHubBuilder {
    pub fn new(clock: MonotonicClock) -> Self {
        Self {
            clock,
            schema: None,
            buffer_capacity: 4096,
            devices: Vec::new(),
            sink: None,
        }
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn schema(mut self, schema: SchemaRegistry) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn device(mut self, device: Box<dyn Device>, options: DeviceOptions) -> Self {
        self.devices.push((device, options));
        self
    }

    /// Create a device from its configured kind.
    pub fn configured_device(
        self,
        name: &str,
        kind: &DeviceKind,
        options: DeviceOptions,
    ) -> HubResult<Self> {
        let device = create_device(name, kind)?;
        Ok(self.device(device, options))
    }

    pub fn sink(mut self, sink: BatchingSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> HubResult<EventHub> {
        let schema = match self.schema {
            Some(schema) => schema,
            None => SchemaRegistry::with_builtin_types()?,
        };

        let mut devices = Vec::with_capacity(self.devices.len() + 1);
        let mut by_name = HashMap::new();
        let mut experiment = None;

        let has_experiment = self
            .devices
            .iter()
            .any(|(d, _)| d.info().device_type == device_type_of(&DeviceKind::Experiment));
        let mut entries = self.devices;
        if !has_experiment {
            entries.insert(
                0,
                (
                    Box::new(ExperimentDevice::new("experiment")) as Box<dyn Device>,
                    DeviceOptions::default(),
                ),
            );
        }

        for (device, options) in entries {
            let name = device.info().name.clone();
            if by_name.contains_key(&name) {
                return Err(HubError::InvalidArgument(format!("duplicate device name '{}'", name)));
            }
            if experiment.is_none()
                && device.info().device_type == device_type_of(&DeviceKind::Experiment)
            {
                experiment = Some(devices.len());
            }
            by_name.insert(name, devices.len());
            devices.push(Arc::new(DeviceSlot::new(device, options)));
        }

        Ok(EventHub {
            clock: self.clock,
            schema: Arc::new(schema),
            devices,
            by_name,
            experiment,
            buffer: Mutex::new(HubBuffer::new(self.buffer_capacity)),
            ids: EventIdSource::new(),
            experiment_id: AtomicU32::new(0),
            session_id: AtomicU32::new(0),
            sink: Mutex::new(self.sink),
            shutdown: CancellationToken::new(),
        })
    }
}

impl EventHub {
    pub fn builder(clock: MonotonicClock) -> EventHubBuilder {
        EventHubBuilder::new(clock)
    }

    pub fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn devices(&self) -> &[Arc<DeviceSlot>] {
        &self.devices
    }

    pub fn device(&self, name: &str) -> HubResult<&Arc<DeviceSlot>> {
        self.by_name
            .get(name)
            .map(|i| &self.devices[*i])
            .ok_or_else(|| HubError::DeviceNotFound(name.to_string()))
    }

    /// Token cancelled when the hub shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Hub shutdown requested");
            self.shutdown.cancel();
        }
    }

    pub fn ids_issued(&self) -> u64 {
        self.ids.issued()
    }

    /// Run one poll of a device and accept its events.
    ///
    /// Returns `false` when the device reported an unrecoverable failure.
    pub fn poll_device(&self, slot: &DeviceSlot) -> bool {
        if slot.is_disabled() {
            return false;
        }
        let previous = *slot.last_poll.lock();
        let mut sink = PollSink::new(self.clock, previous);
        *slot.last_poll.lock() = Some(sink.poll_start());

        let alive = {
            let mut device = slot.device.lock();
            match catch_unwind(AssertUnwindSafe(|| device.poll(&mut sink))) {
                Ok(alive) => alive,
                Err(_) => {
                    tracing::error!(device = %slot.name(), "Device poll panicked");
                    false
                }
            }
        };
        slot.accept(sink.finish(), &self.ids);
        alive
    }

    /// Inject client-originated event tuples under the experiment device.
    /// Every event gets a fresh id; the client's hub_time is kept.
    pub fn inject_events(&self, tuples: &[Value]) -> HubResult<usize> {
        let slot = self
            .experiment
            .map(|i| &self.devices[i])
            .ok_or_else(|| HubError::DeviceNotFound("experiment".to_string()))?;
        let logged_time = self.now();
        let mut natives = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            natives.push(ExperimentDevice::native_from_client(tuple, logged_time)?);
        }
        let n = natives.len();
        slot.accept(natives, &self.ids);
        Ok(n)
    }

    /// Queue a `LogEvent` on the experiment device.
    pub fn log_event(&self, level: u8, text: &str) -> HubResult<()> {
        let slot = self
            .experiment
            .map(|i| &self.devices[i])
            .ok_or_else(|| HubError::DeviceNotFound("experiment".to_string()))?;
        slot.accept(vec![ExperimentDevice::log_event(level, text, self.now())], &self.ids);
        Ok(())
    }

    pub fn log_info(&self, text: &str) -> HubResult<()> {
        self.log_event(log_levels::INFO, text)
    }

    /// Forward a command to a device.
    pub fn send_command(&self, device: &str, command: &str, args: &[Value]) -> HubResult<Value> {
        let slot = self.device(device)?;
        let mut device = slot.device.lock();
        device.handle_command(command, args)
    }

    pub fn enable_event_reporting(&self, device: &str, enabled: bool) -> HubResult<bool> {
        let slot = self.device(device)?;
        slot.reporting.store(enabled, Ordering::Relaxed);
        tracing::info!(device, enabled, "Event reporting switched");
        Ok(enabled)
    }

    pub fn add_listener(&self, device: &str, listener: Arc<dyn EventListener>) -> HubResult<()> {
        self.device(device)?.listeners.lock().push(listener);
        Ok(())
    }

    pub fn set_experiment_id(&self, id: u32) {
        self.experiment_id.store(id, Ordering::Relaxed);
    }

    pub fn experiment_id(&self) -> u32 {
        self.experiment_id.load(Ordering::Relaxed)
    }

    pub fn set_session_id(&self, id: u32) {
        self.session_id.store(id, Ordering::Relaxed);
    }

    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::Relaxed)
    }

    /// Drain every device queue into the ordered buffer.
    ///
    /// A persistence failure is returned as an error and is fatal to the
    /// merge loop; conversion failures only drop the offending event.
    pub fn merge_tick(&self) -> HubResult<MergeStats> {
        let mut stats = MergeStats::default();
        let mut streamed = Vec::new();
        let mut saved = Vec::new();
        let experiment_id = self.experiment_id();
        let session_id = self.session_id();

        for slot in &self.devices {
            let natives = slot.queue.drain();
            if natives.is_empty() {
                continue;
            }
            let converted: Vec<(u64, HubResult<DeviceEvent>)> = {
                let device = slot.device.lock();
                natives
                    .into_iter()
                    .map(|native| (native.event_id, device.to_canonical(native)))
                    .collect()
            };
            // Listeners run without the device lock held.
            for (event_id, result) in converted {
                let mut event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        stats.rejected += 1;
                        tracing::warn!(device = %slot.name(), event_id, error = %e, "Dropping unconvertible event");
                        continue;
                    }
                };
                if let Err(reason) = self.check_layout(&event) {
                    stats.rejected += 1;
                    tracing::warn!(device = %slot.name(), event_id, %reason, "Dropping malformed event");
                    continue;
                }
                event.experiment_id = experiment_id;
                event.session_id = session_id;

                slot.notify(&event);
                if slot.options.save_events {
                    saved.push(event.clone());
                }
                if slot.options.stream_events {
                    streamed.push(event);
                }
            }
        }

        if !streamed.is_empty() {
            let mut buffer = self.buffer.lock();
            for event in streamed {
                stats.merged += 1;
                if buffer.insert(event).is_some() {
                    stats.evicted += 1;
                }
            }
        }
        if stats.evicted > 0 {
            tracing::debug!(evicted = stats.evicted, "Hub buffer full, evicted oldest events");
        }

        if !saved.is_empty() {
            let mut sink = self.sink.lock();
            if let Some(sink) = sink.as_mut() {
                for event in &saved {
                    sink.add_event(event)?;
                }
            }
        }
        Ok(stats)
    }

    fn check_layout(&self, event: &DeviceEvent) -> Result<(), String> {
        match self.schema.record_for_event(event.event_type) {
            Some(record) => record
                .validate(&event.to_values())
                .map_err(|e| format!("{}: {}", record.name(), e)),
            // Unmapped event types only need the core fields.
            None if event.arity() < CORE_EVENT_FIELDS.len() => {
                Err("missing core fields".to_string())
            }
            None => Ok(()),
        }
    }

    /// Take buffered events, earliest first.
    pub fn drain_events(&self, max: Option<usize>) -> Vec<DeviceEvent> {
        self.buffer.lock().drain(max)
    }

    /// Return undelivered events to the buffer.
    pub fn restore_events(&self, events: Vec<DeviceEvent>) {
        if !events.is_empty() {
            self.buffer.lock().restore(events);
        }
    }

    pub fn clear_event_buffer(&self) -> usize {
        self.buffer.lock().clear()
    }

    pub fn buffer_metrics(&self) -> BufferMetrics {
        self.buffer.lock().metrics()
    }

    /// Flush the persistence sink, if one is configured.
    pub fn flush_data_store(&self) -> HubResult<bool> {
        match self.sink.lock().as_mut() {
            Some(sink) => {
                sink.flush()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn has_sink(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Close devices and make a final flush attempt.
    pub fn close(&self) -> HubResult<()> {
        for slot in &self.devices {
            slot.device.lock().close();
        }
        let result = match self.sink.lock().as_mut() {
            Some(sink) => sink.close(),
            None => Ok(()),
        };
        tracing::info!(
            epoch_offset = self.clock.epoch_offset(),
            events = self.ids.issued(),
            "Hub closed"
        );
        result
    }
}
