// UDP request/response server
//
// One datagram in, one datagram out. The codec of each peer is detected
// from its first datagram and pinned for the lifetime of the server.
// Replies that would not fit in one datagram are replaced with an explicit
// IOHUB_ERROR instead of being split or truncated. The peer table is bounded;
// the least recently heard peer is forgotten when it is full.

use crate::codec::Codec;
use crate::error::{HubError, HubResult};
use crate::event::DeviceEvent;
use crate::hub::EventHub;
use crate::protocol::{self, error_reply, events_reply, oversize_reply, tags, DeviceCommand, Request};
use crate::rpc::RpcTable;
use crate::value::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Largest datagram the server will receive.
const RECV_BUFFER_BYTES: usize = 64 * 1024;

/// Peers whose codec is remembered at once.
const MAX_PEERS: usize = 256;

/// Codec pinned for each peer, with a recency stamp for eviction
#[derive(Debug)]
struct PeerTable {
    peers: HashMap<SocketAddr, (Codec, u64)>,
    capacity: usize,
    clock: u64,
}

impl PeerTable {
    fn new(capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    fn len(&self) -> usize {
        self.peers.len()
    }

    /// Codec already pinned for `peer`, refreshing its recency.
    fn get(&mut self, peer: &SocketAddr) -> Option<Codec> {
        self.clock += 1;
        let clock = self.clock;
        self.peers.get_mut(peer).map(|(codec, seen)| {
            *seen = clock;
            *codec
        })
    }

    /// Pin `codec` for a new peer, or return the codec it is pinned to.
    fn pin(&mut self, peer: SocketAddr, codec: Codec) -> Codec {
        if let Some(pinned) = self.get(&peer) {
            return pinned;
        }
        if self.peers.len() >= self.capacity {
            let stalest = self
                .peers
                .iter()
                .min_by_key(|(_, (_, seen))| *seen)
                .map(|(addr, _)| *addr);
            if let Some(addr) = stalest {
                self.peers.remove(&addr);
                tracing::debug!(peer = %addr, "Forgot idle peer");
            }
        }
        tracing::debug!(%peer, codec = codec.name(), "New peer");
        self.peers.insert(peer, (codec, self.clock));
        codec
    }
}

pub struct HubServer {
    socket: UdpSocket,
    hub: Arc<EventHub>,
    rpc: RpcTable,
    peers: PeerTable,
    max_datagram: usize,
}

/// A handled request: the encoded reply plus whether the server should stop
struct Handled {
    reply: Option<Vec<u8>>,
    stop: bool,
}

impl HubServer {
    /// Bind the request socket. Failure here is fatal to the hub.
    pub async fn bind(
        addr: SocketAddr,
        hub: Arc<EventHub>,
        rpc: RpcTable,
        max_datagram: usize,
    ) -> HubResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(addr = %socket.local_addr()?, max_datagram, "Hub server listening");
        Ok(Self {
            socket,
            hub,
            rpc,
            peers: PeerTable::new(MAX_PEERS),
            max_datagram,
        })
    }

    pub fn local_addr(&self) -> HubResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve requests until cancelled or asked to stop.
    pub async fn run(mut self, cancel: CancellationToken) -> HubResult<()> {
        let mut buf = vec![0u8; RECV_BUFFER_BYTES];
        loop {
            let (len, peer) = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port-unreachable from a departed client surfaces here.
                        tracing::warn!(error = %e, "Receive failed");
                        continue;
                    }
                },
            };

            let handled = self.handle_frame(&buf[..len], peer);
            if let Some(reply) = handled.reply {
                if let Err(e) = self.socket.send_to(&reply, peer).await {
                    tracing::warn!(%peer, error = %e, "Failed to send reply");
                }
            }
            if handled.stop {
                tracing::info!(%peer, "Stop requested by client");
                self.hub.request_shutdown();
                cancel.cancel();
                break;
            }
        }
        tracing::info!(peers = self.peers.len(), "Hub server stopped");
        Ok(())
    }

    fn handle_frame(&mut self, frame: &[u8], peer: SocketAddr) -> Handled {
        let codec = match Codec::detect(frame) {
            Ok(codec) => codec,
            Err(e) => match self.peers.get(&peer) {
                // A known peer is answered in its pinned codec.
                Some(pinned) => {
                    tracing::warn!(%peer, error = %e, "Undecodable request");
                    let reply = error_reply("DECODE", &e.to_string());
                    return self.encode_reply(pinned, &reply, "DECODE", Vec::new(), false);
                }
                None => {
                    tracing::warn!(%peer, error = %e, "Dropping undecodable datagram");
                    return Handled { reply: None, stop: false };
                }
            },
        };

        let pinned = self.peers.pin(peer, codec);
        if pinned != codec {
            let reason = format!("peer is pinned to {}, got {}", pinned.name(), codec.name());
            tracing::warn!(%peer, %reason, "Codec switch rejected");
            return self.encode_reply(codec, &error_reply("CODEC", &reason), "CODEC", Vec::new(), false);
        }

        let message = match codec.decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "Undecodable request");
                let reply = error_reply("DECODE", &e.to_string());
                return self.encode_reply(codec, &reply, "DECODE", Vec::new(), false);
            }
        };
        let request = match Request::parse(message) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "Malformed request");
                return self.encode_reply(codec, &e.to_reply(), &e.request_type, Vec::new(), false);
            }
        };

        tracing::trace!(%peer, request = request.request_type(), "Request");
        let request_type = request.request_type();
        let stop = matches!(request, Request::Stop);
        let (reply, drained) = self.process(request);
        self.encode_reply(codec, &reply, request_type, drained, stop)
    }

    fn process(&self, request: Request) -> (Value, Vec<DeviceEvent>) {
        let hub = &self.hub;
        match request {
            Request::GetEvents => {
                let events = hub.drain_events(None);
                (events_reply(&events), events)
            }
            Request::EventTx(tuples) => match hub.inject_events(&tuples) {
                Ok(n) => (tagged(tags::EVENT_TX_RESULT, Value::from(n)), Vec::new()),
                Err(e) => (error_reply(tags::EXP_DEVICE, &e.to_string()), Vec::new()),
            },
            Request::CmdTx(commands) => {
                let delivered = commands
                    .iter()
                    .filter(|raw| match DeviceCommand::from_value(raw) {
                        Ok(cmd) => match hub.send_command(&cmd.device, &cmd.command, &cmd.args) {
                            Ok(_) => true,
                            Err(e) => {
                                tracing::warn!(device = %cmd.device, command = %cmd.command, error = %e, "Device command failed");
                                false
                            }
                        },
                        Err(reason) => {
                            tracing::warn!(%reason, "Malformed device command");
                            false
                        }
                    })
                    .count();
                (tagged(tags::CMD_TX_RESULT, Value::from(delivered)), Vec::new())
            }
            Request::DevRpc {
                device,
                method,
                args,
                kwargs,
            } => {
                let result = if kwargs.is_empty() {
                    hub.send_command(&device, &method, &args)
                } else {
                    Err(HubError::InvalidArgument(
                        "device methods take positional arguments only".to_string(),
                    ))
                };
                match result {
                    Ok(value) => (tagged(tags::DEV_RPC_RESULT, value), Vec::new()),
                    Err(e) => {
                        tracing::warn!(%device, %method, error = %e, "Device method failed");
                        let reply = Value::List(vec![
                            Value::from(tags::IOHUB_ERROR),
                            Value::from(tags::DEV_RPC),
                            Value::from(device),
                            Value::from(method),
                            Value::from(e.to_string()),
                        ]);
                        (reply, Vec::new())
                    }
                }
            }
            Request::GetDeviceList => {
                let list: Vec<Value> = hub
                    .devices()
                    .iter()
                    .map(|slot| {
                        Value::List(vec![
                            Value::from(slot.name()),
                            Value::from(slot.info().class_name.as_str()),
                        ])
                    })
                    .collect();
                (
                    Value::List(vec![
                        Value::from(tags::GET_DEV_LIST_RESULT),
                        Value::from(list.len()),
                        Value::List(list),
                    ]),
                    Vec::new(),
                )
            }
            Request::GetDevInterface(name) => match hub.device(&name) {
                Ok(slot) => {
                    let names = slot.command_names().into_iter().map(Value::from).collect();
                    (tagged(tags::GET_DEV_INTERFACE, Value::List(names)), Vec::new())
                }
                Err(e) => {
                    let reply = Value::List(vec![
                        Value::from(tags::IOHUB_ERROR),
                        Value::from(tags::GET_DEV_INTERFACE),
                        Value::from(name),
                        Value::from(e.to_string()),
                    ]);
                    (reply, Vec::new())
                }
            },
            Request::Rpc { name, args, kwargs } => {
                let outcome = self.rpc.dispatch(hub, &name, &args, &kwargs);
                (outcome.reply, outcome.drained)
            }
            Request::Stop => (tagged(tags::STOP_IOHUB_SERVER_RESULT, Value::Bool(true)), Vec::new()),
        }
    }

    fn encode_reply(
        &self,
        codec: Codec,
        reply: &Value,
        request_type: &str,
        drained: Vec<DeviceEvent>,
        stop: bool,
    ) -> Handled {
        let encoded = match codec.encode(reply) {
            Ok(bytes) if bytes.len() <= self.max_datagram => {
                return Handled {
                    reply: Some(bytes),
                    stop,
                }
            }
            Ok(bytes) => {
                tracing::warn!(
                    request = request_type,
                    size = bytes.len(),
                    limit = self.max_datagram,
                    events = drained.len(),
                    "Reply exceeds one datagram"
                );
                codec.encode(&oversize_reply(request_type, bytes.len(), self.max_datagram))
            }
            Err(e) => {
                tracing::error!(request = request_type, error = %e, "Failed to encode reply");
                codec.encode(&error_reply(request_type, &e.to_string()))
            }
        };
        // The original reply was not sent; keep its events.
        self.hub.restore_events(drained);
        match encoded {
            Ok(bytes) => Handled {
                reply: Some(bytes),
                stop,
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode error reply");
                Handled { reply: None, stop }
            }
        }
    }
}

fn tagged(tag: &str, value: Value) -> Value {
    Value::List(vec![Value::from(tag), value])
}

/// True if `reply` is an error reply of either kind.
pub fn is_error_reply(reply: &Value) -> bool {
    matches!(
        protocol::reply_tag(reply),
        Some(tags::IOHUB_ERROR) | Some(tags::RPC_ERROR)
    )
}
