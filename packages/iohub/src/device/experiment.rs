// Experiment device
//
// Stands in for the experiment-control process: it is never polled, and its
// events arrive over EXP_DEVICE EVENT_TX as complete event tuples that
// already carry a hub_time in the shared timebase. The hub also routes its
// own log messages through this device.

use super::{Device, DeviceInfo, PollSink};
use crate::error::{HubError, HubResult};
use crate::event::{DeviceEvent, NativeEvent};
use crate::record::{clip_text, device_types, event_types, TEXT_WIDTH};
use crate::value::Value;

/// Log levels carried by `LogEvent`
pub mod log_levels {
    pub const CRITICAL: u8 = 50;
    pub const ERROR: u8 = 40;
    pub const WARNING: u8 = 30;
    pub const DATA: u8 = 25;
    pub const INFO: u8 = 20;
    pub const DEBUG: u8 = 10;
}

pub struct ExperimentDevice {
    info: DeviceInfo,
}

impl ExperimentDevice {
    pub fn new(name: &str) -> Self {
        Self {
            info: DeviceInfo::new(name, "Experiment", device_types::EXPERIMENT)
                .with_model("Experiment Runtime")
                .with_event_types(&[event_types::MESSAGE, event_types::LOG]),
        }
    }

    /// Native event for a client-originated tuple. The client's hub_time
    /// and device_time are kept; ids are reassigned by the hub.
    pub fn native_from_client(tuple: &Value, logged_time: f64) -> HubResult<NativeEvent> {
        let event = DeviceEvent::from_tuple(tuple)?;
        Ok(NativeEvent {
            event_id: 0,
            event_type: event.event_type,
            device_time: event.device_time,
            logged_time,
            hub_time: Some(event.hub_time),
            confidence_interval: event.confidence_interval,
            delay: event.delay,
            filter_id: event.filter_id,
            data: event.payload,
        })
    }

    /// Native `LogEvent` for a hub-side log message. Text longer than the
    /// record's `text` field is clipped.
    pub fn log_event(level: u8, text: &str, time: f64) -> NativeEvent {
        let mut event = NativeEvent::new(
            event_types::LOG,
            time,
            vec![Value::from(level as u16), Value::from(clip_text(text, TEXT_WIDTH))],
        );
        event.hub_time = Some(time);
        event
    }
}

impl Device for ExperimentDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn poll(&mut self, _sink: &mut PollSink) -> bool {
        true
    }

    fn to_canonical(&self, native: NativeEvent) -> HubResult<DeviceEvent> {
        if native.hub_time.is_none() {
            return Err(HubError::device(
                &self.info.name,
                format!("event {} carries no hub_time", native.event_id),
            ));
        }
        Ok(DeviceEvent::from_native(native))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;

    #[test]
    fn test_client_tuple_keeps_hub_time() {
        let tuple = tuple![
            0u32, 0u32, 999u64, event_types::MESSAGE, 1.0, 1.0, 1.25, 0.0, 0.0, 0i64,
            0.0, "trial", "stimulus onset"
        ];
        let native = ExperimentDevice::native_from_client(&tuple, 2.0).unwrap();
        assert_eq!(native.hub_time, Some(1.25));
        assert_eq!(native.logged_time, 2.0);
        assert_eq!(native.event_id, 0);
        assert_eq!(native.data.len(), 3);

        let device = ExperimentDevice::new("experiment");
        let event = device.to_canonical(native).unwrap();
        assert_eq!(event.hub_time, 1.25);
    }

    #[test]
    fn test_log_event_payload() {
        let native = ExperimentDevice::log_event(log_levels::WARNING, "low disk", 3.0);
        assert_eq!(native.event_type, event_types::LOG);
        assert_eq!(native.data, vec![Value::Int(30), Value::from("low disk")]);
    }

    #[test]
    fn test_experiment_rejects_commands() {
        let mut device = ExperimentDevice::new("experiment");
        assert!(matches!(
            device.handle_command("pause", &[]),
            Err(HubError::UnsupportedCommand { .. })
        ));
    }
}
