// Synthetic analog input: one sine sample per poll

use super::{Device, DeviceInfo, PollSink};
use crate::error::{HubError, HubResult};
use crate::record::{device_types, event_types};
use crate::value::Value;
use std::f64::consts::TAU;

pub struct SyntheticDevice {
    info: DeviceInfo,
    amplitude: f64,
    frequency_hz: f64,
    offset: f64,
    sequence: u64,
    paused: bool,
    /// Overrides the generated signal while set
    held_value: Option<f64>,
}

impl SyntheticDevice {
    pub fn new(name: &str, amplitude: f64, frequency_hz: f64, offset: f64) -> Self {
        Self {
            info: DeviceInfo::new(name, "AnalogInput", device_types::ANALOGINPUT)
                .with_model("Synthetic Signal Generator")
                .with_event_types(&[event_types::SAMPLE]),
            amplitude,
            frequency_hz,
            offset,
            sequence: 0,
            paused: false,
            held_value: None,
        }
    }

    fn sample_at(&self, t: f64) -> f64 {
        self.held_value
            .unwrap_or_else(|| self.offset + self.amplitude * (TAU * self.frequency_hz * t).sin())
    }
}

impl Device for SyntheticDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn poll(&mut self, sink: &mut PollSink) -> bool {
        if self.paused {
            return true;
        }
        let t = sink.now();
        let value = self.sample_at(t);
        sink.emit(
            event_types::SAMPLE,
            Some(t),
            vec![Value::from(self.sequence), Value::Float(value)],
        );
        self.sequence += 1;
        true
    }

    fn command_names(&self) -> Vec<&'static str> {
        vec!["pause", "resume", "set_value"]
    }

    fn handle_command(&mut self, command: &str, args: &[Value]) -> HubResult<Value> {
        match command {
            "pause" => {
                self.paused = true;
                Ok(Value::Bool(true))
            }
            "resume" => {
                self.paused = false;
                Ok(Value::Bool(true))
            }
            "set_value" => {
                // nil (or no argument) releases the held value
                self.held_value = match args.first() {
                    None | Some(Value::Nil) => None,
                    Some(v) => Some(v.as_f64().ok_or_else(|| {
                        HubError::InvalidArgument(format!("set_value expects a number, got {}", v.kind()))
                    })?),
                };
                Ok(Value::from(self.held_value))
            }
            other => Err(HubError::UnsupportedCommand {
                device: self.info.name.clone(),
                command: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timebase::MonotonicClock;

    fn poll_once(device: &mut SyntheticDevice) -> Vec<crate::event::NativeEvent> {
        let mut sink = PollSink::new(MonotonicClock::starting_now(), None);
        assert!(device.poll(&mut sink));
        sink.finish()
    }

    #[test]
    fn test_one_sample_per_poll_with_sequence() {
        let mut device = SyntheticDevice::new("sine", 2.0, 10.0, 0.0);
        let a = poll_once(&mut device);
        let b = poll_once(&mut device);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].data[0], Value::Int(0));
        assert_eq!(b[0].data[0], Value::Int(1));
        let v = b[0].data[1].as_f64().unwrap();
        assert!(v.abs() <= 2.0);
    }

    #[test]
    fn test_pause_resume_and_hold() {
        let mut device = SyntheticDevice::new("sine", 1.0, 1.0, 0.0);
        device.handle_command("pause", &[]).unwrap();
        assert!(poll_once(&mut device).is_empty());
        device.handle_command("resume", &[]).unwrap();

        device.handle_command("set_value", &[Value::Float(3.5)]).unwrap();
        assert_eq!(poll_once(&mut device)[0].data[1], Value::Float(3.5));

        device.handle_command("set_value", &[Value::Nil]).unwrap();
        assert!(poll_once(&mut device)[0].data[1].as_f64().unwrap().abs() <= 1.0);

        assert!(device.handle_command("set_value", &[Value::from("x")]).is_err());
        assert!(device.handle_command("explode", &[]).is_err());
    }
}
