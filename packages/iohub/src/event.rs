// Event representations
//
// `NativeEvent` is what a device produces during `poll()` and what sits in
// its bounded queue; `DeviceEvent` is the canonical record the hub merges
// and serves. On the wire a `DeviceEvent` is a flat tuple: the ten core
// fields in fixed order followed by the type-specific fields.

use crate::error::{HubError, HubResult};
use crate::record::CORE_EVENT_FIELDS;
use crate::value::Value;
use serde::Serialize;

/// Event as acquired by a device, before canonical conversion
#[derive(Debug, Clone, PartialEq)]
pub struct NativeEvent {
    /// Assigned when the event is accepted into the device queue
    pub event_id: u64,
    pub event_type: u16,
    pub device_time: f64,
    pub logged_time: f64,
    /// Set by the source only when it already knows the hub time
    /// (client-originated events); otherwise back-filled at merge.
    pub hub_time: Option<f64>,
    pub confidence_interval: f64,
    pub delay: f64,
    pub filter_id: i64,
    pub data: Vec<Value>,
}

impl NativeEvent {
    pub fn new(event_type: u16, device_time: f64, data: Vec<Value>) -> Self {
        Self {
            event_id: 0,
            event_type,
            device_time,
            logged_time: device_time,
            hub_time: None,
            confidence_interval: 0.0,
            delay: 0.0,
            filter_id: 0,
            data,
        }
    }

    /// Hub time estimate: acquisition time minus the mean polling latency.
    pub fn estimated_hub_time(&self) -> f64 {
        self.hub_time.unwrap_or(self.logged_time - self.delay)
    }
}

/// Canonical event record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceEvent {
    pub experiment_id: u32,
    pub session_id: u32,
    pub event_id: u64,
    pub event_type: u16,
    pub device_time: f64,
    pub logged_time: f64,
    pub hub_time: f64,
    pub confidence_interval: f64,
    pub delay: f64,
    pub filter_id: i64,
    /// Type-specific fields following the core fields
    pub payload: Vec<Value>,
}

impl DeviceEvent {
    /// Canonical form of a native event; experiment and session ids are
    /// left at zero for the hub to stamp.
    pub fn from_native(native: NativeEvent) -> Self {
        let hub_time = native.estimated_hub_time();
        Self {
            experiment_id: 0,
            session_id: 0,
            event_id: native.event_id,
            event_type: native.event_type,
            device_time: native.device_time,
            logged_time: native.logged_time,
            hub_time,
            confidence_interval: native.confidence_interval,
            delay: native.delay,
            filter_id: native.filter_id,
            payload: native.data,
        }
    }

    /// Number of values in the flat tuple.
    pub fn arity(&self) -> usize {
        CORE_EVENT_FIELDS.len() + self.payload.len()
    }

    pub fn to_values(&self) -> Vec<Value> {
        let mut values = Vec::with_capacity(self.arity());
        values.push(Value::from(self.experiment_id));
        values.push(Value::from(self.session_id));
        values.push(Value::from(self.event_id));
        values.push(Value::from(self.event_type));
        values.push(Value::Float(self.device_time));
        values.push(Value::Float(self.logged_time));
        values.push(Value::Float(self.hub_time));
        values.push(Value::Float(self.confidence_interval));
        values.push(Value::Float(self.delay));
        values.push(Value::Int(self.filter_id));
        values.extend(self.payload.iter().cloned());
        values
    }

    pub fn to_tuple(&self) -> Value {
        Value::List(self.to_values())
    }

    /// Parse a flat event tuple.
    pub fn from_tuple(tuple: &Value) -> HubResult<Self> {
        let values = tuple
            .as_list()
            .ok_or_else(|| HubError::Protocol(format!("event must be a list, got {}", tuple.kind())))?;
        if values.len() < CORE_EVENT_FIELDS.len() {
            return Err(HubError::Protocol(format!(
                "event tuple has {} values, needs at least {}",
                values.len(),
                CORE_EVENT_FIELDS.len()
            )));
        }

        let int = |i: usize| {
            values[i].as_i64().ok_or_else(|| {
                HubError::Protocol(format!("{} must be an integer", CORE_EVENT_FIELDS[i]))
            })
        };
        let float = |i: usize| {
            values[i].as_f64().ok_or_else(|| {
                HubError::Protocol(format!("{} must be a number", CORE_EVENT_FIELDS[i]))
            })
        };
        let narrow = |i: usize, v: i64| {
            HubError::Protocol(format!("{} out of range: {}", CORE_EVENT_FIELDS[i], v))
        };

        let experiment_id = int(0)?;
        let session_id = int(1)?;
        let event_id = int(2)?;
        let event_type = int(3)?;
        Ok(Self {
            experiment_id: u32::try_from(experiment_id).map_err(|_| narrow(0, experiment_id))?,
            session_id: u32::try_from(session_id).map_err(|_| narrow(1, session_id))?,
            event_id: u64::try_from(event_id).map_err(|_| narrow(2, event_id))?,
            event_type: u16::try_from(event_type).map_err(|_| narrow(3, event_type))?,
            device_time: float(4)?,
            logged_time: float(5)?,
            hub_time: float(6)?,
            confidence_interval: float(7)?,
            delay: float(8)?,
            filter_id: int(9)?,
            payload: values[CORE_EVENT_FIELDS.len()..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::event_types;

    #[test]
    fn test_hub_time_backfill() {
        let mut native = NativeEvent::new(event_types::SAMPLE, 1.0, vec![]);
        native.logged_time = 2.0;
        native.delay = 0.25;
        assert_eq!(native.estimated_hub_time(), 1.75);

        native.hub_time = Some(1.5);
        assert_eq!(DeviceEvent::from_native(native).hub_time, 1.5);
    }

    #[test]
    fn test_tuple_layout() {
        let mut native = NativeEvent::new(
            event_types::LOG,
            3.0,
            vec![Value::Int(20), Value::from("hello")],
        );
        native.event_id = 42;
        let mut event = DeviceEvent::from_native(native);
        event.experiment_id = 7;

        let values = event.to_values();
        assert_eq!(values.len(), 12);
        assert_eq!(values[0], Value::Int(7));
        assert_eq!(values[2], Value::Int(42));
        assert_eq!(values[3], Value::Int(event_types::LOG as i64));
        assert_eq!(values[11], Value::from("hello"));

        let back = DeviceEvent::from_tuple(&event.to_tuple()).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_short_or_malformed_tuple_rejected() {
        let short = Value::List(vec![Value::Int(1); 4]);
        assert!(DeviceEvent::from_tuple(&short).is_err());

        let mut values = vec![Value::Int(0); 10];
        values[6] = Value::from("not a time");
        assert!(DeviceEvent::from_tuple(&Value::List(values)).is_err());

        let mut values = vec![Value::Int(0); 10];
        values[3] = Value::Int(70_000);
        assert!(DeviceEvent::from_tuple(&Value::List(values)).is_err());
    }
}
