// Request vocabulary of the hub datagram protocol
//
// Every message is a list whose first element names the request (or, for
// replies, the result/error tag).

use crate::event::DeviceEvent;
use crate::value::Value;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod tags {
    pub const GET_EVENTS: &str = "GET_EVENTS";
    pub const EXP_DEVICE: &str = "EXP_DEVICE";
    pub const RPC: &str = "RPC";
    pub const STOP_IOHUB_SERVER: &str = "STOP_IOHUB_SERVER";

    pub const EVENT_TX: &str = "EVENT_TX";
    pub const CMD_TX: &str = "CMD_TX";
    pub const DEV_RPC: &str = "DEV_RPC";
    pub const GET_DEV_LIST: &str = "GET_DEV_LIST";
    pub const GET_DEV_INTERFACE: &str = "GET_DEV_INTERFACE";

    pub const GET_EVENTS_RESULT: &str = "GET_EVENTS_RESULT";
    pub const EVENT_TX_RESULT: &str = "EVENT_TX_RESULT";
    pub const CMD_TX_RESULT: &str = "CMD_TX_RESULT";
    pub const DEV_RPC_RESULT: &str = "DEV_RPC_RESULT";
    pub const GET_DEV_LIST_RESULT: &str = "GET_DEV_LIST_RESULT";
    pub const RPC_RESULT: &str = "RPC_RESULT";
    pub const STOP_IOHUB_SERVER_RESULT: &str = "STOP_IOHUB_SERVER_RESULT";

    pub const RPC_ERROR: &str = "RPC_ERROR";
    pub const IOHUB_ERROR: &str = "IOHUB_ERROR";
}

/// Reason a message could not be turned into a request
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{request_type}: {reason}")]
pub struct ProtocolError {
    pub request_type: String,
    pub reason: String,
}

impl ProtocolError {
    pub fn new(request_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            reason: reason.into(),
        }
    }

    /// `(IOHUB_ERROR, request_type, reason)`
    pub fn to_reply(&self) -> Value {
        error_reply(&self.request_type, &self.reason)
    }
}

/// One command for a device, as carried by CMD_TX
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCommand {
    pub device: String,
    pub command: String,
    pub args: Vec<Value>,
}

impl DeviceCommand {
    pub fn new(device: impl Into<String>, command: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            device: device.into(),
            command: command.into(),
            args,
        }
    }

    /// Parse `[device, command]` or `[device, command, [args...]]`.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let items = value
            .as_list()
            .ok_or_else(|| format!("command must be a list, got {}", value.kind()))?;
        let text = |i: usize, what: &str| {
            items
                .get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| format!("command {} must be a string", what))
        };
        let device = text(0, "device")?;
        let command = text(1, "name")?;
        let args = match items.get(2) {
            None | Some(Value::Nil) => Vec::new(),
            Some(Value::List(args)) => args.clone(),
            Some(single) => vec![single.clone()],
        };
        Ok(Self {
            device,
            command,
            args,
        })
    }

    pub fn to_value(&self) -> Value {
        Value::List(vec![
            Value::from(self.device.as_str()),
            Value::from(self.command.as_str()),
            Value::List(self.args.clone()),
        ])
    }
}

/// A decoded client request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetEvents,
    EventTx(Vec<Value>),
    CmdTx(Vec<Value>),
    /// Call one device method and reply with its result
    DevRpc {
        device: String,
        method: String,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    },
    GetDeviceList,
    GetDevInterface(String),
    Rpc {
        name: String,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    },
    Stop,
}

impl Request {
    pub fn parse(message: Value) -> Result<Self, ProtocolError> {
        let mut items = message
            .into_list()
            .ok_or_else(|| ProtocolError::new("UNKNOWN", "request must be a list"))?
            .into_iter();
        let request_type = match items.next() {
            Some(Value::Str(s)) => s,
            Some(other) => {
                return Err(ProtocolError::new(
                    "UNKNOWN",
                    format!("request type must be a string, got {}", other.kind()),
                ))
            }
            None => return Err(ProtocolError::new("UNKNOWN", "empty request")),
        };

        match request_type.as_str() {
            tags::GET_EVENTS => Ok(Request::GetEvents),
            tags::STOP_IOHUB_SERVER => Ok(Request::Stop),
            tags::EXP_DEVICE => Self::parse_exp_device(items),
            tags::RPC => Self::parse_rpc(items),
            other => Err(ProtocolError::new(other, "request type not supported")),
        }
    }

    fn parse_exp_device(mut items: impl Iterator<Item = Value>) -> Result<Self, ProtocolError> {
        let fail = |reason: String| ProtocolError::new(tags::EXP_DEVICE, reason);
        let sub = match items.next() {
            Some(Value::Str(s)) => s,
            _ => return Err(fail("missing sub-request".to_string())),
        };
        let list_payload = |payload: Option<Value>| match payload {
            Some(Value::List(list)) => Ok(list),
            Some(Value::Nil) | None => Ok(Vec::new()),
            Some(other) => Err(fail(format!("{} payload must be a list, got {}", sub, other.kind()))),
        };
        match sub.as_str() {
            tags::EVENT_TX => Ok(Request::EventTx(list_payload(items.next())?)),
            tags::CMD_TX => Ok(Request::CmdTx(list_payload(items.next())?)),
            tags::DEV_RPC => {
                let mut text = |what: &str| match items.next() {
                    Some(Value::Str(s)) => Ok(s),
                    _ => Err(fail(format!("DEV_RPC needs a {}", what))),
                };
                let device = text("device name")?;
                let method = text("method name")?;
                let (args, kwargs) = Self::parse_call_args(tags::EXP_DEVICE, items)?;
                Ok(Request::DevRpc {
                    device,
                    method,
                    args,
                    kwargs,
                })
            }
            tags::GET_DEV_LIST => Ok(Request::GetDeviceList),
            tags::GET_DEV_INTERFACE => match items.next() {
                Some(Value::Str(name)) => Ok(Request::GetDevInterface(name)),
                _ => Err(fail("GET_DEV_INTERFACE needs a device name".to_string())),
            },
            _ => Err(fail(format!("device request type '{}' not supported", sub))),
        }
    }

    fn parse_rpc(mut items: impl Iterator<Item = Value>) -> Result<Self, ProtocolError> {
        let name = match items.next() {
            Some(Value::Str(s)) => s,
            _ => return Err(ProtocolError::new(tags::RPC, "missing method name")),
        };
        let (args, kwargs) = Self::parse_call_args(tags::RPC, items)?;
        Ok(Request::Rpc { name, args, kwargs })
    }

    /// Optional `[args]` and `{kwargs}` trailing a method name.
    fn parse_call_args(
        request_type: &str,
        mut items: impl Iterator<Item = Value>,
    ) -> Result<(Vec<Value>, BTreeMap<String, Value>), ProtocolError> {
        let args = match items.next() {
            None | Some(Value::Nil) => Vec::new(),
            Some(Value::List(args)) => args,
            Some(other) => {
                return Err(ProtocolError::new(
                    request_type,
                    format!("args must be a list, got {}", other.kind()),
                ))
            }
        };
        let kwargs = match items.next() {
            None | Some(Value::Nil) => BTreeMap::new(),
            Some(Value::Map(kwargs)) => kwargs,
            Some(other) => {
                return Err(ProtocolError::new(
                    request_type,
                    format!("kwargs must be a map, got {}", other.kind()),
                ))
            }
        };
        Ok((args, kwargs))
    }

    /// Tag used when reporting errors about this request.
    pub fn request_type(&self) -> &'static str {
        match self {
            Request::GetEvents => tags::GET_EVENTS,
            Request::EventTx(_)
            | Request::CmdTx(_)
            | Request::DevRpc { .. }
            | Request::GetDeviceList
            | Request::GetDevInterface(_) => tags::EXP_DEVICE,
            Request::Rpc { .. } => tags::RPC,
            Request::Stop => tags::STOP_IOHUB_SERVER,
        }
    }

    pub fn to_value(&self) -> Value {
        let s = |t: &str| Value::from(t);
        match self {
            Request::GetEvents => Value::List(vec![s(tags::GET_EVENTS)]),
            Request::Stop => Value::List(vec![s(tags::STOP_IOHUB_SERVER)]),
            Request::EventTx(events) => Value::List(vec![
                s(tags::EXP_DEVICE),
                s(tags::EVENT_TX),
                Value::List(events.clone()),
            ]),
            Request::CmdTx(commands) => Value::List(vec![
                s(tags::EXP_DEVICE),
                s(tags::CMD_TX),
                Value::List(commands.clone()),
            ]),
            Request::DevRpc {
                device,
                method,
                args,
                kwargs,
            } => Value::List(vec![
                s(tags::EXP_DEVICE),
                s(tags::DEV_RPC),
                s(device),
                s(method),
                Value::List(args.clone()),
                Value::Map(kwargs.clone()),
            ]),
            Request::GetDeviceList => Value::List(vec![s(tags::EXP_DEVICE), s(tags::GET_DEV_LIST)]),
            Request::GetDevInterface(name) => Value::List(vec![
                s(tags::EXP_DEVICE),
                s(tags::GET_DEV_INTERFACE),
                s(name),
            ]),
            Request::Rpc { name, args, kwargs } => Value::List(vec![
                s(tags::RPC),
                s(name),
                Value::List(args.clone()),
                Value::Map(kwargs.clone()),
            ]),
        }
    }
}

/// `(IOHUB_ERROR, request_type, reason)`
pub fn error_reply(request_type: &str, reason: &str) -> Value {
    Value::List(vec![
        Value::from(tags::IOHUB_ERROR),
        Value::from(request_type),
        Value::from(reason),
    ])
}

/// `(IOHUB_ERROR, request_type, "response too large", size, limit)`
pub fn oversize_reply(request_type: &str, size: usize, limit: usize) -> Value {
    Value::List(vec![
        Value::from(tags::IOHUB_ERROR),
        Value::from(request_type),
        Value::from("response too large"),
        Value::from(size),
        Value::from(limit),
    ])
}

/// `(GET_EVENTS_RESULT, [tuple...])`, or `(GET_EVENTS_RESULT, None)` when empty.
pub fn events_reply(events: &[DeviceEvent]) -> Value {
    let payload = if events.is_empty() {
        Value::Nil
    } else {
        Value::List(events.iter().map(DeviceEvent::to_tuple).collect())
    };
    Value::List(vec![Value::from(tags::GET_EVENTS_RESULT), payload])
}

/// Tag of a reply message, if it has one.
pub fn reply_tag(reply: &Value) -> Option<&str> {
    reply.as_list()?.first()?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;

    #[test]
    fn test_parse_requests() {
        assert_eq!(Request::parse(tuple!["GET_EVENTS"]).unwrap(), Request::GetEvents);
        assert_eq!(
            Request::parse(tuple!["EXP_DEVICE", "GET_DEV_INTERFACE", "mouse"]).unwrap(),
            Request::GetDevInterface("mouse".into())
        );
        match Request::parse(tuple!["RPC", "getTime"]).unwrap() {
            Request::Rpc { name, args, kwargs } => {
                assert_eq!(name, "getTime");
                assert!(args.is_empty() && kwargs.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_exp_device_sub_requests() {
        assert_eq!(
            Request::parse(tuple!["EXP_DEVICE", "GET_DEV_LIST"]).unwrap(),
            Request::GetDeviceList
        );
        match Request::parse(tuple!["EXP_DEVICE", "DEV_RPC", "sine", "pause"]).unwrap() {
            Request::DevRpc {
                device,
                method,
                args,
                kwargs,
            } => {
                assert_eq!((device.as_str(), method.as_str()), ("sine", "pause"));
                assert!(args.is_empty() && kwargs.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        let err = Request::parse(tuple!["EXP_DEVICE", "DEV_RPC", "sine"]).unwrap_err();
        assert_eq!(err.request_type, "EXP_DEVICE");
        assert!(Request::parse(tuple!["EXP_DEVICE", "DEV_RPC", "sine", "pause", 3i64]).is_err());
    }

    #[test]
    fn test_to_value_parses_back() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("enabled".to_string(), Value::Bool(true));
        let requests = vec![
            Request::GetEvents,
            Request::Stop,
            Request::EventTx(vec![tuple![1i64]]),
            Request::CmdTx(vec![DeviceCommand::new("sine", "pause", vec![]).to_value()]),
            Request::GetDeviceList,
            Request::DevRpc {
                device: "sine".into(),
                method: "set_value".into(),
                args: vec![Value::Float(2.0)],
                kwargs: BTreeMap::new(),
            },
            Request::Rpc {
                name: "enableEventReporting".into(),
                args: vec![Value::from("sine")],
                kwargs,
            },
        ];
        for request in requests {
            assert_eq!(Request::parse(request.to_value()).unwrap(), request);
        }
    }

    #[test]
    fn test_unknown_request_types() {
        let err = Request::parse(tuple!["DANCE"]).unwrap_err();
        assert_eq!(err.request_type, "DANCE");
        assert_eq!(reply_tag(&err.to_reply()), Some(tags::IOHUB_ERROR));

        let err = Request::parse(tuple!["EXP_DEVICE", "ADD_DEVICE"]).unwrap_err();
        assert_eq!(err.request_type, "EXP_DEVICE");

        assert!(Request::parse(Value::Int(1)).is_err());
        assert!(Request::parse(tuple![]).is_err());
        assert!(Request::parse(tuple!["RPC", "x", "not a list"]).is_err());
    }

    #[test]
    fn test_device_command_forms() {
        let cmd = DeviceCommand::from_value(&tuple!["sine", "set_value", 2.0]).unwrap();
        assert_eq!(cmd.args, vec![Value::Float(2.0)]);
        let cmd = DeviceCommand::from_value(&tuple!["sine", "pause"]).unwrap();
        assert!(cmd.args.is_empty());
        assert!(DeviceCommand::from_value(&tuple!["sine"]).is_err());
    }

    #[test]
    fn test_empty_events_reply_is_none() {
        assert_eq!(events_reply(&[]), tuple!["GET_EVENTS_RESULT", Value::Nil]);
    }
}
