// Device abstraction
//
// A device is polled cooperatively by its own scheduler task. `poll()` must
// never block: it reads whatever native events are available right now and
// hands them to the `PollSink`, which stamps acquisition timing. The hub
// assigns event ids when the sink's events are accepted into the device
// queue, and converts them to canonical records at merge time.
//
// New backends are added by:
// 1. Implementing the `Device` trait
// 2. Adding a variant to `DeviceKind`
// 3. Registering it in `create_device`

mod datagram;
mod experiment;
mod synthetic;

use crate::error::{HubError, HubResult};
use crate::event::{DeviceEvent, NativeEvent};
use crate::record::device_types;
use crate::timebase::MonotonicClock;
use crate::value::Value;
use serde::{Deserialize, Serialize};

pub use datagram::DatagramDevice;
pub use experiment::{log_levels, ExperimentDevice};
pub use synthetic::SyntheticDevice;

/// Backend selection and backend-specific settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceKind {
    /// Client-fed device; never polled
    #[serde(rename = "experiment")]
    Experiment,

    /// Software signal generator emitting one sample per poll
    #[serde(rename = "synthetic")]
    Synthetic {
        #[serde(default = "default_amplitude")]
        amplitude: f64,
        #[serde(default = "default_frequency")]
        frequency_hz: f64,
        #[serde(default)]
        offset: f64,
    },

    /// Non-blocking UDP bridge for external JSON datagrams
    #[serde(rename = "datagram")]
    Datagram {
        bind_addr: String,
        /// Upper bound on datagrams consumed by one poll
        #[serde(default = "default_max_per_poll")]
        max_per_poll: usize,
    },
}

fn default_amplitude() -> f64 {
    1.0
}

fn default_frequency() -> f64 {
    1.0
}

fn default_max_per_poll() -> usize {
    64
}

impl DeviceKind {
    /// Class name reported in device lists.
    pub fn class_name(&self) -> &'static str {
        match self {
            DeviceKind::Experiment => "Experiment",
            DeviceKind::Synthetic { .. } => "AnalogInput",
            DeviceKind::Datagram { .. } => "Datagram",
        }
    }
}

/// Static description of a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub class_name: String,
    pub device_type: u16,
    pub device_number: u8,
    pub manufacturer_name: String,
    pub model_name: String,
    /// Event types this device can produce
    pub event_types: Vec<u16>,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, class_name: impl Into<String>, device_type: u16) -> Self {
        Self {
            name: name.into(),
            class_name: class_name.into(),
            device_type,
            device_number: 0,
            manufacturer_name: "ioHub".to_string(),
            model_name: String::new(),
            event_types: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_name = model.into();
        self
    }

    pub fn with_event_types(mut self, event_types: &[u16]) -> Self {
        self.event_types = event_types.to_vec();
        self
    }

    /// Values for the `Device` record type, in field order.
    pub fn record_values(&self, event_buffer_length: usize) -> Vec<Value> {
        vec![
            Value::from(self.name.as_str()),
            Value::from(self.device_number as u16),
            Value::from(self.manufacturer_name.as_str()),
            Value::from(self.model_name.as_str()),
            Value::from(""),
            Value::from(env!("CARGO_PKG_VERSION")),
            Value::from(""),
            Value::from(""),
            Value::from(""),
            Value::from(""),
            Value::from(event_buffer_length.min(u16::MAX as usize)),
        ]
    }
}

/// Collects the events produced by one `poll()` call and stamps their timing
pub struct PollSink {
    clock: MonotonicClock,
    poll_start: f64,
    delay: f64,
    pending: Vec<NativeEvent>,
}

impl PollSink {
    /// `previous_poll` is the start time of the device's previous poll.
    pub fn new(clock: MonotonicClock, previous_poll: Option<f64>) -> Self {
        let poll_start = clock.now();
        let delay = previous_poll
            .map(|prev| ((poll_start - prev) / 2.0).max(0.0))
            .unwrap_or(0.0);
        Self {
            clock,
            poll_start,
            delay,
            pending: Vec::new(),
        }
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn poll_start(&self) -> f64 {
        self.poll_start
    }

    /// Record one native event. `device_time` defaults to the logged time
    /// when the device has no clock of its own.
    pub fn emit(&mut self, event_type: u16, device_time: Option<f64>, data: Vec<Value>) {
        let logged_time = self.clock.now();
        let mut event = NativeEvent::new(event_type, device_time.unwrap_or(logged_time), data);
        event.logged_time = logged_time;
        event.delay = self.delay;
        self.pending.push(event);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Close the poll: every event gets the span of the poll call as its
    /// confidence interval.
    pub fn finish(self) -> Vec<NativeEvent> {
        let span = (self.clock.now() - self.poll_start).max(0.0);
        let mut events = self.pending;
        for event in &mut events {
            event.confidence_interval = span;
        }
        events
    }
}

/// Polymorphic input device
pub trait Device: Send {
    fn info(&self) -> &DeviceInfo;

    /// Read available native events without waiting.
    ///
    /// Returns `false` only on unrecoverable failure; the scheduler then
    /// stops polling and disables the device.
    fn poll(&mut self, sink: &mut PollSink) -> bool;

    /// Convert a native event into the device's canonical record.
    fn to_canonical(&self, native: NativeEvent) -> HubResult<DeviceEvent> {
        Ok(DeviceEvent::from_native(native))
    }

    /// Commands accepted by `handle_command`.
    fn command_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn handle_command(&mut self, command: &str, _args: &[Value]) -> HubResult<Value> {
        Err(HubError::UnsupportedCommand {
            device: self.info().name.clone(),
            command: command.to_string(),
        })
    }

    fn close(&mut self) {}
}

/// In-process observer notified with each merged event of a device
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &DeviceEvent) -> HubResult<()>;
}

impl<F> EventListener for F
where
    F: Fn(&DeviceEvent) -> HubResult<()> + Send + Sync,
{
    fn on_event(&self, event: &DeviceEvent) -> HubResult<()> {
        self(event)
    }
}

/// Factory function to create devices from configuration
pub fn create_device(name: &str, kind: &DeviceKind) -> HubResult<Box<dyn Device>> {
    let device: Box<dyn Device> = match kind {
        DeviceKind::Experiment => Box::new(ExperimentDevice::new(name)),
        DeviceKind::Synthetic {
            amplitude,
            frequency_hz,
            offset,
        } => Box::new(SyntheticDevice::new(name, *amplitude, *frequency_hz, *offset)),
        DeviceKind::Datagram {
            bind_addr,
            max_per_poll,
        } => Box::new(DatagramDevice::bind(name, bind_addr, *max_per_poll)?),
    };
    tracing::debug!(device = name, class = kind.class_name(), "Created device");
    Ok(device)
}

/// Device type id for a configured backend.
pub fn device_type_of(kind: &DeviceKind) -> u16 {
    match kind {
        DeviceKind::Experiment => device_types::EXPERIMENT,
        DeviceKind::Synthetic { .. } => device_types::ANALOGINPUT,
        DeviceKind::Datagram { .. } => device_types::OTHER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::event_types;

    #[test]
    fn test_poll_sink_stamps_timing() {
        let clock = MonotonicClock::starting_now();
        let previous = clock.now() - 0.010;
        let mut sink = PollSink::new(clock, Some(previous));
        sink.emit(event_types::SAMPLE, None, vec![Value::Int(1), Value::Float(0.0)]);
        sink.emit(event_types::SAMPLE, Some(0.5), vec![Value::Int(2), Value::Float(0.0)]);
        let start = sink.poll_start();
        let events = sink.finish();

        assert_eq!(events.len(), 2);
        assert!(events[0].delay >= 0.005);
        assert_eq!(events[0].device_time, events[0].logged_time);
        assert_eq!(events[1].device_time, 0.5);
        assert!(events[1].logged_time >= start);
        assert_eq!(events[0].confidence_interval, events[1].confidence_interval);
        assert!(events.iter().all(|e| e.event_id == 0 && e.hub_time.is_none()));
    }

    #[test]
    fn test_first_poll_has_no_delay() {
        let mut sink = PollSink::new(MonotonicClock::starting_now(), None);
        sink.emit(event_types::SAMPLE, None, vec![]);
        assert_eq!(sink.finish()[0].delay, 0.0);
    }

    #[test]
    fn test_device_kind_from_yaml() {
        let kind: DeviceKind = serde_yaml::from_str("type: synthetic\nfrequency_hz: 5.0\n").unwrap();
        assert_eq!(
            kind,
            DeviceKind::Synthetic {
                amplitude: 1.0,
                frequency_hz: 5.0,
                offset: 0.0
            }
        );
        let kind: DeviceKind = serde_json::from_str(r#"{"type":"experiment"}"#).unwrap();
        assert_eq!(kind.class_name(), "Experiment");
        assert_eq!(device_type_of(&kind), device_types::EXPERIMENT);
    }

    #[test]
    fn test_closure_listener() {
        let listener = |event: &DeviceEvent| -> HubResult<()> {
            if event.event_id == 0 {
                Err(HubError::InvalidArgument("zero id".into()))
            } else {
                Ok(())
            }
        };
        let event = DeviceEvent::from_native(NativeEvent::new(1, 0.0, vec![]));
        assert!(listener.on_event(&event).is_err());
    }
}
