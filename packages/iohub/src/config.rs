use crate::device::DeviceKind;
use crate::error::HubResult;
use crate::hub::{DeviceOptions, EventHub, EventHubBuilder};
use crate::timebase::MonotonicClock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hub configuration: file values, then environment overrides, then CLI flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the request socket binds to
    pub bind_addr: String,
    /// UDP port for requests (0 is rejected; tests bind ephemeral ports directly)
    pub port: u16,
    /// Capacity of the shared time-ordered buffer
    pub global_event_buffer: usize,
    /// Merge tick period
    pub merge_interval_ms: u64,
    /// Largest reply the server will send in one datagram
    pub max_datagram_bytes: usize,
    /// Persisted events per sink flush
    pub flush_every: usize,
    /// JSON-lines file receiving persisted events
    pub data_file: Option<PathBuf>,
    pub devices: Vec<DeviceConfig>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 9000,
            global_event_buffer: 4096,
            merge_interval_ms: 1,
            max_datagram_bytes: 65000,
            flush_every: 128,
            data_file: None,
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_event_buffer_length")]
    pub event_buffer_length: usize,
    /// Absent for event-driven devices, which get no poller
    #[serde(default)]
    pub poll_interval_ms: Option<f64>,
    #[serde(default = "default_true")]
    pub save_events: bool,
    #[serde(default = "default_true")]
    pub stream_events: bool,
    pub kind: DeviceKind,
}

fn default_true() -> bool {
    true
}

fn default_event_buffer_length() -> usize {
    1024
}

impl DeviceConfig {
    pub fn options(&self) -> DeviceOptions {
        DeviceOptions {
            event_buffer_length: self.event_buffer_length,
            poll_interval: self
                .poll_interval_ms
                .map(|ms| Duration::from_secs_f64(ms.max(0.0) / 1000.0)),
            save_events: self.save_events,
            stream_events: self.stream_events,
        }
    }
}

impl HubConfig {
    /// Load from file (if given), apply `.env` and environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML or JSON file, chosen by extension.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&text)?),
            Some("json") => Ok(serde_json::from_str(&text)?),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Apply `IOHUB_*` overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("IOHUB_PORT") {
            self.port = port.trim().parse().map_err(|_| ConfigError::InvalidPort)?;
        }
        if let Some(addr) = lookup("IOHUB_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(size) = lookup("IOHUB_EVENT_BUFFER") {
            self.global_event_buffer = parse_env("IOHUB_EVENT_BUFFER", &size)?;
        }
        if let Some(every) = lookup("IOHUB_FLUSH_EVERY") {
            self.flush_every = parse_env("IOHUB_FLUSH_EVERY", &every)?;
        }
        if let Some(file) = lookup("IOHUB_DATA_FILE") {
            self.data_file = if file.is_empty() {
                None
            } else {
                Some(PathBuf::from(file))
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        self.bind_ip()?;
        if self.global_event_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "global_event_buffer must be greater than zero".to_string(),
            ));
        }
        if self.flush_every == 0 {
            return Err(ConfigError::InvalidValue(
                "flush_every must be greater than zero".to_string(),
            ));
        }
        if self.max_datagram_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "max_datagram_bytes must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.is_empty() {
                return Err(ConfigError::InvalidValue("device name must not be empty".to_string()));
            }
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.name.clone()));
            }
            if device.event_buffer_length == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "device '{}': event_buffer_length must be greater than zero",
                    device.name
                )));
            }
            if let Some(ms) = device.poll_interval_ms {
                if !ms.is_finite() || ms < 0.0 {
                    return Err(ConfigError::InvalidValue(format!(
                        "device '{}': poll_interval_ms must be a non-negative number",
                        device.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.port))
    }

    pub fn merge_interval(&self) -> Duration {
        Duration::from_millis(self.merge_interval_ms)
    }

    /// Devices that are switched on.
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.devices.iter().filter(|d| d.enable)
    }

    /// Hub builder carrying the buffer size and every enabled device.
    pub fn hub_builder(&self, clock: MonotonicClock) -> HubResult<EventHubBuilder> {
        let mut builder = EventHub::builder(clock).buffer_capacity(self.global_event_buffer);
        for device in self.enabled_devices() {
            builder = builder.configured_device(&device.name, &device.kind, device.options())?;
        }
        Ok(builder)
    }

    fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("invalid bind_addr '{}'", self.bind_addr)))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnvVar {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Invalid value for environment variable {name}: '{value}'")]
    InvalidEnvVar { name: String, value: String },

    #[error("Duplicate device name: {0}")]
    DuplicateDevice(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported configuration format: {0} (expected .yaml, .yml or .json)")]
    UnsupportedFormat(PathBuf),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn write_config(suffix: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.port, 9000);
        assert_eq!(config.global_event_buffer, 4096);
        assert_eq!(config.flush_every, 128);
        assert_eq!(config.merge_interval(), Duration::from_millis(1));
        assert!(config.validate().is_ok());
        assert_eq!(
            config.bind_address().unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_yaml_file() {
        let file = write_config(
            ".yaml",
            r#"
port: 9123
global_event_buffer: 512
devices:
  - name: sine
    poll_interval_ms: 0.5
    save_events: false
    kind:
      type: synthetic
      frequency_hz: 10.0
  - name: daq
    enable: false
    kind:
      type: datagram
      bind_addr: "127.0.0.1:0"
"#,
        );

        let config = HubConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9123);
        assert_eq!(config.global_event_buffer, 512);
        assert_eq!(config.devices.len(), 2);

        let sine = &config.devices[0];
        assert_eq!(sine.event_buffer_length, 1024);
        assert!(matches!(sine.kind, DeviceKind::Synthetic { frequency_hz, .. } if frequency_hz == 10.0));
        let options = sine.options();
        assert_eq!(options.poll_interval, Some(Duration::from_micros(500)));
        assert!(!options.save_events);
        assert!(options.stream_events);

        let enabled: Vec<_> = config.enabled_devices().map(|d| d.name.as_str()).collect();
        assert_eq!(enabled, vec!["sine"]);
    }

    #[test]
    fn test_json_file() {
        let file = write_config(
            ".json",
            r#"{"port": 9200, "devices": [{"name": "exp", "kind": {"type": "experiment"}}]}"#,
        );
        let config = HubConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9200);
        assert_eq!(config.devices[0].kind, DeviceKind::Experiment);
        assert_eq!(config.devices[0].options().poll_interval, None);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = write_config(".toml", "port = 1");
        assert!(matches!(
            HubConfig::from_file(file.path()),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("IOHUB_PORT", "9400"),
            ("IOHUB_BIND_ADDR", "0.0.0.0"),
            ("IOHUB_EVENT_BUFFER", "64"),
            ("IOHUB_DATA_FILE", "/tmp/events.jsonl"),
        ]
        .into_iter()
        .collect();

        let mut config = HubConfig::default();
        config
            .apply_env_with(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.port, 9400);
        assert_eq!(config.bind_addr, "0.0.0.0");
        assert_eq!(config.global_event_buffer, 64);
        assert_eq!(config.flush_every, 128);
        assert_eq!(config.data_file, Some(PathBuf::from("/tmp/events.jsonl")));
    }

    #[test]
    fn test_bad_env_values() {
        let mut config = HubConfig::default();
        let err = config
            .apply_env_with(|name| (name == "IOHUB_PORT").then(|| "ninety".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort));

        let err = config
            .apply_env_with(|name| (name == "IOHUB_FLUSH_EVERY").then(|| "-3".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar { .. }));
    }

    #[test]
    fn test_validation() {
        let device = |name: &str| DeviceConfig {
            name: name.to_string(),
            enable: true,
            event_buffer_length: 16,
            poll_interval_ms: Some(1.0),
            save_events: true,
            stream_events: true,
            kind: DeviceKind::Experiment,
        };

        let mut config = HubConfig {
            devices: vec![device("a"), device("a")],
            ..HubConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateDevice(name)) if name == "a"));

        config.devices = vec![DeviceConfig {
            event_buffer_length: 0,
            ..device("a")
        }];
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        config.devices.clear();
        config.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort)));

        config.port = 9000;
        config.bind_addr = "localhost-ish".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hub_builder_skips_disabled_devices() {
        let config = HubConfig {
            devices: vec![
                DeviceConfig {
                    name: "sine".to_string(),
                    enable: true,
                    event_buffer_length: 8,
                    poll_interval_ms: Some(2.0),
                    save_events: true,
                    stream_events: true,
                    kind: DeviceKind::Synthetic {
                        amplitude: 1.0,
                        frequency_hz: 1.0,
                        offset: 0.0,
                    },
                },
                DeviceConfig {
                    name: "off".to_string(),
                    enable: false,
                    event_buffer_length: 8,
                    poll_interval_ms: None,
                    save_events: true,
                    stream_events: true,
                    kind: DeviceKind::Experiment,
                },
            ],
            ..HubConfig::default()
        };

        let hub = config
            .hub_builder(MonotonicClock::starting_now())
            .unwrap()
            .build()
            .unwrap();
        let names: Vec<_> = hub.devices().iter().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["experiment", "sine"]);
        assert_eq!(hub.device("sine").unwrap().poll_interval(), Some(Duration::from_millis(2)));
        assert!(hub.device("off").is_err());
    }
}
