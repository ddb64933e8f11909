// Built-in record types and type ids

use crate::schema::{FieldType, SchemaError, SchemaRegistry};

/// Event type ids carried in the `event_type_id` field
pub mod event_types {
    pub const DATAGRAM: u16 = 1;
    pub const SAMPLE: u16 = 122;
    pub const MESSAGE: u16 = 151;
    pub const LOG: u16 = 152;

    pub fn name(event_type: u16) -> Option<&'static str> {
        match event_type {
            DATAGRAM => Some("DATAGRAM"),
            SAMPLE => Some("SAMPLE"),
            MESSAGE => Some("MESSAGE"),
            LOG => Some("LOG"),
            _ => None,
        }
    }
}

/// Device type ids reported in device metadata
pub mod device_types {
    pub const OTHER: u16 = 1;
    pub const ANALOGINPUT: u16 = 120;
    pub const EXPERIMENT: u16 = 150;
}

/// Names of the universal fields every event tuple starts with.
pub const CORE_EVENT_FIELDS: [&str; 10] = [
    "experiment_id",
    "session_id",
    "event_id",
    "event_type_id",
    "device_time",
    "logged_time",
    "hub_time",
    "confidence_interval",
    "delay",
    "filter_id",
];

pub const DEVICE_RECORD: &str = "Device";
pub const DEVICE_EVENT_RECORD: &str = "DeviceEvent";
pub const MESSAGE_EVENT_RECORD: &str = "MessageEvent";
pub const LOG_EVENT_RECORD: &str = "LogEvent";
pub const SAMPLE_EVENT_RECORD: &str = "SampleEvent";
pub const DATAGRAM_EVENT_RECORD: &str = "DatagramEvent";

pub const NAME_WIDTH: usize = 32;
pub const TEXT_WIDTH: usize = 128;

/// Longest prefix of `text` that fits in `width` bytes on a char boundary.
pub fn clip_text(text: &str, width: usize) -> &str {
    if text.len() <= width {
        return text;
    }
    let mut end = width;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub(crate) fn register_builtin_types(registry: &mut SchemaRegistry) -> Result<(), SchemaError> {
    registry
        .define(DEVICE_RECORD)
        .field("name", FieldType::Str(NAME_WIDTH))
        .field("device_number", FieldType::U8)
        .field("manufacturer_name", FieldType::Str(NAME_WIDTH))
        .field("model_name", FieldType::Str(NAME_WIDTH))
        .field("model_number", FieldType::Str(NAME_WIDTH))
        .field("software_version", FieldType::Str(8))
        .field("hardware_version", FieldType::Str(8))
        .field("firmware_version", FieldType::Str(8))
        .field("serial_number", FieldType::Str(NAME_WIDTH))
        .field("manufacture_date", FieldType::Str(10))
        .field("event_buffer_length", FieldType::U16)
        .register()?;

    let mut core = registry.define(DEVICE_EVENT_RECORD);
    for (name, ty) in CORE_EVENT_FIELDS.iter().zip(core_field_types()) {
        core = core.field(*name, ty);
    }
    core.register()?;

    registry
        .define(MESSAGE_EVENT_RECORD)
        .extends(DEVICE_EVENT_RECORD)
        .field("msg_offset", FieldType::F32)
        .field("category", FieldType::Str(NAME_WIDTH))
        .field("text", FieldType::Str(TEXT_WIDTH))
        .register()?;

    registry
        .define(LOG_EVENT_RECORD)
        .extends(DEVICE_EVENT_RECORD)
        .field("log_level", FieldType::U8)
        .field("text", FieldType::Str(TEXT_WIDTH))
        .register()?;

    registry
        .define(SAMPLE_EVENT_RECORD)
        .extends(DEVICE_EVENT_RECORD)
        .field("sequence", FieldType::U64)
        .field("value", FieldType::F64)
        .register()?;

    registry
        .define(DATAGRAM_EVENT_RECORD)
        .extends(DEVICE_EVENT_RECORD)
        .field("channel", FieldType::U16)
        .field("value", FieldType::F64)
        .field("label", FieldType::Str(NAME_WIDTH))
        .register()?;

    registry.map_event_type(event_types::MESSAGE, MESSAGE_EVENT_RECORD)?;
    registry.map_event_type(event_types::LOG, LOG_EVENT_RECORD)?;
    registry.map_event_type(event_types::SAMPLE, SAMPLE_EVENT_RECORD)?;
    registry.map_event_type(event_types::DATAGRAM, DATAGRAM_EVENT_RECORD)?;
    Ok(())
}

fn core_field_types() -> [FieldType; 10] {
    [
        FieldType::U32, // experiment_id
        FieldType::U32, // session_id
        FieldType::U64, // event_id
        FieldType::U16, // event_type_id
        FieldType::F64, // device_time
        FieldType::F64, // logged_time
        FieldType::F64, // hub_time
        FieldType::F32, // confidence_interval
        FieldType::F32, // delay
        FieldType::I16, // filter_id
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_chains_are_independent() {
        let registry = SchemaRegistry::with_builtin_types().unwrap();
        let device = registry.get(DEVICE_RECORD).unwrap();
        let event = registry.get(DEVICE_EVENT_RECORD).unwrap();
        assert!(device
            .field_names()
            .iter()
            .all(|f| event.index_of(f).is_none()));
        assert_eq!(event.field_names(), CORE_EVENT_FIELDS.to_vec());
    }

    #[test]
    fn test_event_records_extend_core_fields() {
        let registry = SchemaRegistry::with_builtin_types().unwrap();
        let core = registry.get(DEVICE_EVENT_RECORD).unwrap();
        for event_type in [
            event_types::MESSAGE,
            event_types::LOG,
            event_types::SAMPLE,
            event_types::DATAGRAM,
        ] {
            let record = registry.record_for_event(event_type).unwrap();
            assert_eq!(&record.field_names()[..10], &CORE_EVENT_FIELDS[..]);
            assert_eq!(&record.offsets()[..10], core.offsets());
        }
        assert_eq!(
            registry.get(LOG_EVENT_RECORD).unwrap().field_names()[10..],
            ["log_level", "text"]
        );
    }
}
