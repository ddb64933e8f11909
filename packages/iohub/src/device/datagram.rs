// UDP datagram input bridge
//
// Binds a non-blocking socket and, on each poll, consumes whatever JSON
// datagrams are already waiting. Each datagram is one reading:
// {"channel": 0, "value": 1.5, "label": "x", "device_time": 12.0}

use super::{Device, DeviceInfo, PollSink};
use crate::error::{HubError, HubResult};
use crate::record::{clip_text, device_types, event_types, NAME_WIDTH};
use crate::value::Value;
use serde::Deserialize;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

#[derive(Debug, Deserialize)]
struct Reading {
    channel: u16,
    value: f64,
    #[serde(default)]
    label: String,
    #[serde(default)]
    device_time: Option<f64>,
}

pub struct DatagramDevice {
    info: DeviceInfo,
    socket: UdpSocket,
    buffer: Vec<u8>,
    max_per_poll: usize,
    rejected: u64,
}

impl DatagramDevice {
    pub fn bind(name: &str, bind_addr: &str, max_per_poll: usize) -> HubResult<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| HubError::device(name, format!("bind {} failed: {}", bind_addr, e)))?;
        socket.set_nonblocking(true)?;
        tracing::info!(device = name, addr = %socket.local_addr()?, "Datagram input bound");

        Ok(Self {
            info: DeviceInfo::new(name, "Datagram", device_types::OTHER)
                .with_model("UDP JSON Bridge")
                .with_event_types(&[event_types::DATAGRAM]),
            socket,
            buffer: vec![0u8; 65_536],
            max_per_poll: max_per_poll.max(1),
            rejected: 0,
        })
    }

    pub fn local_addr(&self) -> HubResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Datagrams that could not be parsed so far.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

impl Device for DatagramDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn poll(&mut self, sink: &mut PollSink) -> bool {
        for _ in 0..self.max_per_poll {
            let (len, peer) = match self.socket.recv_from(&mut self.buffer) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(device = %self.info.name, error = %e, "Datagram receive failed");
                    break;
                }
            };
            match serde_json::from_slice::<Reading>(&self.buffer[..len]) {
                Ok(reading) => sink.emit(
                    event_types::DATAGRAM,
                    reading.device_time,
                    vec![
                        Value::from(reading.channel),
                        Value::Float(reading.value),
                        Value::from(clip_text(&reading.label, NAME_WIDTH)),
                    ],
                ),
                Err(e) => {
                    self.rejected += 1;
                    tracing::warn!(device = %self.info.name, %peer, error = %e, "Ignoring malformed datagram");
                }
            }
        }
        true
    }

    fn command_names(&self) -> Vec<&'static str> {
        vec!["rejected_count"]
    }

    fn handle_command(&mut self, command: &str, _args: &[Value]) -> HubResult<Value> {
        match command {
            "rejected_count" => Ok(Value::from(self.rejected)),
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
    use std::time::Duration;

    #[test]
    fn test_poll_drains_waiting_datagrams() {
        let mut device = DatagramDevice::bind("daq", "127.0.0.1:0", 16).unwrap();
        let target = device.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(br#"{"channel":2,"value":1.5,"label":"ain2","device_time":9.0}"#, target)
            .unwrap();
        sender.send_to(b"not json", target).unwrap();
        sender.send_to(br#"{"channel":3,"value":-1.0}"#, target).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let mut sink = PollSink::new(MonotonicClock::starting_now(), None);
        assert!(device.poll(&mut sink));
        let events = sink.finish();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].device_time, 9.0);
        assert_eq!(
            events[0].data,
            vec![Value::Int(2), Value::Float(1.5), Value::from("ain2")]
        );
        assert_eq!(events[1].data[2], Value::from(""));
        assert_eq!(device.rejected(), 1);
    }

    #[test]
    fn test_empty_poll_does_not_block() {
        let mut device = DatagramDevice::bind("daq", "127.0.0.1:0", 4).unwrap();
        let mut sink = PollSink::new(MonotonicClock::starting_now(), None);
        assert!(device.poll(&mut sink));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_label_clipping_respects_char_boundaries() {
        let label = "é".repeat(20);
        let clipped = clip_text(&label, NAME_WIDTH);
        assert!(clipped.len() <= NAME_WIDTH);
        assert_eq!(clipped.chars().count(), 16);
    }
}
