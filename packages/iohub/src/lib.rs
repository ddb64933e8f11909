pub mod client;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod hub;
pub mod persistence;
pub mod protocol;
pub mod queue;
pub mod record;
pub mod rpc;
pub mod scheduler;
pub mod schema;
pub mod server;
pub mod timebase;
pub mod value;

pub use client::{spawn_hub, HubClient, HubProcess};
pub use codec::Codec;
pub use config::{DeviceConfig, HubConfig};
pub use device::{Device, DeviceInfo, DeviceKind, EventListener, PollSink};
pub use error::{HubError, HubResult};
pub use event::{DeviceEvent, NativeEvent};
pub use hub::{DeviceOptions, EventHub, EventHubBuilder};
pub use persistence::{BatchingSink, EventSink, JsonLinesSink, MemorySink};
pub use protocol::{DeviceCommand, Request};
pub use rpc::RpcTable;
pub use schema::{FieldType, RecordType, SchemaRegistry};
pub use server::HubServer;
pub use timebase::MonotonicClock;
pub use value::Value;
