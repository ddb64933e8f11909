// RPC dispatch table
//
// Method names map to typed handlers registered up front. Unregistered names
// are rejected outright; handler errors and panics are caught here and turned
// into RPC_ERROR replies so a faulty call never takes the hub down.

use crate::error::{HubError, HubResult};
use crate::event::DeviceEvent;
use crate::hub::EventHub;
use crate::protocol::{events_reply, tags};
use crate::record::DEVICE_RECORD;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Arguments and hub access for one RPC invocation
pub struct RpcCall<'a> {
    pub hub: &'a EventHub,
    pub args: &'a [Value],
    pub kwargs: &'a BTreeMap<String, Value>,
    drained: RefCell<Vec<DeviceEvent>>,
}

impl<'a> RpcCall<'a> {
    pub fn new(hub: &'a EventHub, args: &'a [Value], kwargs: &'a BTreeMap<String, Value>) -> Self {
        Self {
            hub,
            args,
            kwargs,
            drained: RefCell::new(Vec::new()),
        }
    }

    /// Argument by keyword, falling back to position.
    pub fn arg(&self, index: usize, name: &str) -> Option<&Value> {
        self.kwargs
            .get(name)
            .or_else(|| self.args.get(index))
            .filter(|v| !v.is_nil())
    }

    pub fn required(&self, index: usize, name: &str) -> HubResult<&Value> {
        self.arg(index, name)
            .ok_or_else(|| HubError::InvalidArgument(format!("missing argument '{}'", name)))
    }

    pub fn required_str(&self, index: usize, name: &str) -> HubResult<&str> {
        let v = self.required(index, name)?;
        v.as_str()
            .ok_or_else(|| HubError::InvalidArgument(format!("'{}' must be a string, got {}", name, v.kind())))
    }

    pub fn required_u32(&self, index: usize, name: &str) -> HubResult<u32> {
        let v = self.required(index, name)?;
        v.as_i64()
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| HubError::InvalidArgument(format!("'{}' must be a non-negative integer", name)))
    }

    /// Drain events from the hub; they are returned to the buffer if the
    /// reply cannot be delivered.
    pub fn take_events(&self, max: Option<usize>) -> Vec<DeviceEvent> {
        let events = self.hub.drain_events(max);
        self.drained.borrow_mut().extend(events.iter().cloned());
        events
    }

    fn into_drained(self) -> Vec<DeviceEvent> {
        self.drained.into_inner()
    }
}

/// Reply to an RPC and any events it removed from the hub buffer
#[derive(Debug)]
pub struct RpcOutcome {
    pub reply: Value,
    pub drained: Vec<DeviceEvent>,
}

type Handler = Box<dyn Fn(&RpcCall<'_>) -> HubResult<Value> + Send + Sync>;

/// Registry mapping method names to handlers
pub struct RpcTable {
    handlers: HashMap<String, Handler>,
}

impl Default for RpcTable {
    fn default() -> Self {
        Self::with_builtin_methods()
    }
}

impl RpcTable {
    /// Table with no methods.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(&RpcCall<'_>) -> HubResult<Value> + Send + Sync + 'static,
    {
        if self.handlers.insert(name.to_string(), Box::new(handler)).is_some() {
            tracing::warn!(method = name, "RPC method re-registered");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn dispatch(
        &self,
        hub: &EventHub,
        name: &str,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> RpcOutcome {
        let Some(handler) = self.handlers.get(name) else {
            tracing::warn!(method = name, "Unknown RPC method");
            return RpcOutcome {
                reply: Value::List(vec![
                    Value::from(tags::RPC_ERROR),
                    Value::from(name),
                    Value::from("not found"),
                ]),
                drained: Vec::new(),
            };
        };

        let call = RpcCall::new(hub, args, kwargs);
        let result = catch_unwind(AssertUnwindSafe(|| handler(&call)));
        let diagnostic = match result {
            Ok(Ok(value)) => {
                tracing::trace!(method = name, "RPC completed");
                return RpcOutcome {
                    reply: Value::List(vec![Value::from(tags::RPC_RESULT), Value::from(name), value]),
                    drained: call.into_drained(),
                };
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        tracing::error!(method = name, error = %diagnostic, "RPC dispatch failed");
        // Nothing was delivered, so drained events go back.
        hub.restore_events(call.into_drained());
        RpcOutcome {
            reply: Value::List(vec![
                Value::from(tags::RPC_ERROR),
                Value::from(name),
                Value::List(args.to_vec()),
                Value::Map(kwargs.clone()),
                Value::from(diagnostic),
            ]),
            drained: Vec::new(),
        }
    }

    /// Table with the hub's public methods.
    pub fn with_builtin_methods() -> Self {
        let mut table = Self::empty();
        table
            .register("getTime", |call| Ok(Value::Float(call.hub.now())))
            .register("getEpochOffset", |call| {
                Ok(Value::Float(call.hub.clock().epoch_offset()))
            })
            .register("clearEventBuffer", |call| {
                Ok(Value::from(call.hub.clear_event_buffer()))
            })
            .register("getEvents", |call| {
                let max = match call.arg(0, "max_count") {
                    Some(v) => Some(
                        v.as_i64()
                            .and_then(|n| usize::try_from(n).ok())
                            .ok_or_else(|| {
                                HubError::InvalidArgument("max_count must be a non-negative integer".into())
                            })?,
                    ),
                    None => None,
                };
                let events = call.take_events(max);
                // Same payload shape as GET_EVENTS_RESULT.
                let reply = events_reply(&events);
                Ok(reply.into_list().and_then(|mut l| l.pop()).unwrap_or_default())
            })
            .register("getDeviceList", device_list)
            .register("enableEventReporting", |call| {
                let device = call.required_str(0, "device")?;
                let enabled = call
                    .arg(1, "enabled")
                    .map(|v| {
                        v.as_bool().ok_or_else(|| {
                            HubError::InvalidArgument("enabled must be a boolean".into())
                        })
                    })
                    .transpose()?
                    .unwrap_or(true);
                Ok(Value::Bool(call.hub.enable_event_reporting(device, enabled)?))
            })
            .register("setExperimentInfo", |call| {
                let id = call.required_u32(0, "experiment_id")?;
                call.hub.set_experiment_id(id);
                tracing::info!(experiment_id = id, "Experiment id set");
                Ok(Value::from(id))
            })
            .register("createExperimentSessionEntry", |call| {
                let id = call.required_u32(0, "session_id")?;
                call.hub.set_session_id(id);
                tracing::info!(session_id = id, "Session id set");
                Ok(Value::from(id))
            })
            .register("logMessage", |call| {
                let text = call.required_str(0, "text")?;
                let level = match call.arg(1, "level") {
                    Some(v) => v
                        .as_i64()
                        .and_then(|l| u8::try_from(l).ok())
                        .ok_or_else(|| HubError::InvalidArgument("level must be 0-255".into()))?,
                    None => crate::device::log_levels::INFO,
                };
                call.hub.log_event(level, text)?;
                Ok(Value::Bool(true))
            })
            .register("flushDataStore", |call| {
                Ok(Value::Bool(call.hub.flush_data_store()?))
            })
            .register("getBufferMetrics", |call| {
                Value::from_serialize(&call.hub.buffer_metrics())
                    .map_err(|e| HubError::InvalidArgument(e.to_string()))
            })
            .register("shutDown", |call| {
                call.hub.request_shutdown();
                Ok(Value::Bool(true))
            });
        table
    }
}

fn device_list(call: &RpcCall<'_>) -> HubResult<Value> {
    let record = call
        .hub
        .schema()
        .get(DEVICE_RECORD)
        .ok_or_else(|| HubError::InvalidArgument(format!("no '{}' record type", DEVICE_RECORD)))?;
    let mut devices = Vec::with_capacity(call.hub.devices().len());
    for slot in call.hub.devices() {
        let values = slot.info().record_values(slot.queue_metrics().capacity);
        let mut entry: BTreeMap<String, Value> = record
            .to_row(&values)?
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        entry.insert("class_name".into(), Value::from(slot.info().class_name.as_str()));
        entry.insert("device_type".into(), Value::from(slot.info().device_type));
        entry.insert("reporting".into(), Value::Bool(slot.is_reporting()));
        entry.insert("disabled".into(), Value::Bool(slot.is_disabled()));
        devices.push(Value::Map(entry));
    }
    Ok(Value::List(devices))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}
