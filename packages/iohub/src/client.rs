// Experiment-side client
//
// Talks to a hub over its UDP request socket with one codec for the whole
// session, and can launch the hub as a child process. The hub never times a
// request out; the client does.

use crate::codec::Codec;
use crate::error::{HubError, HubResult};
use crate::event::DeviceEvent;
use crate::protocol::{reply_tag, tags, DeviceCommand, Request};
use crate::timebase::MonotonicClock;
use crate::value::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Status line printed by the hub once its socket is bound
pub const READY_LINE: &str = "IOHUB_READY";
/// Status line prefix printed by the hub on a fatal startup error
pub const FAILED_LINE: &str = "IOHUB_FAILED";

const RECV_BUFFER_BYTES: usize = 64 * 1024;

pub struct HubClient {
    socket: UdpSocket,
    codec: Codec,
    timeout: Duration,
}

impl HubClient {
    pub async fn connect(server: SocketAddr, codec: Codec) -> HubResult<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            ([127, 0, 0, 1], 0).into()
        } else {
            (std::net::Ipv6Addr::LOCALHOST, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        tracing::debug!(%server, codec = codec.name(), "Hub client connected");
        Ok(Self {
            socket,
            codec,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Send one request and wait for its reply, returned undecoded.
    pub async fn request(&self, request: &Request) -> HubResult<Value> {
        self.send_raw(&request.to_value()).await
    }

    /// Send an arbitrary message. Used for requests the typed enum cannot express.
    pub async fn send_raw(&self, message: &Value) -> HubResult<Value> {
        let frame = self.codec.encode(message)?;
        self.socket.send(&frame).await?;

        let mut buf = vec![0u8; RECV_BUFFER_BYTES];
        let len = tokio::time::timeout(self.timeout, self.socket.recv(&mut buf))
            .await
            .map_err(|_| HubError::Timeout(format!("no reply within {:?}", self.timeout)))??;
        Ok(self.codec.decode(&buf[..len])?)
    }

    /// Drain the hub's buffer, oldest first.
    pub async fn get_events(&self) -> HubResult<Vec<DeviceEvent>> {
        let reply = self.request(&Request::GetEvents).await?;
        let payload = expect_tag(reply, tags::GET_EVENTS_RESULT)?;
        match payload.first() {
            None | Some(Value::Nil) => Ok(Vec::new()),
            Some(Value::List(tuples)) => tuples.iter().map(DeviceEvent::from_tuple).collect(),
            Some(other) => Err(HubError::Protocol(format!(
                "GET_EVENTS_RESULT payload must be a list, got {}",
                other.kind()
            ))),
        }
    }

    /// Push events for the experiment device. Returns how many the hub accepted.
    pub async fn send_events(&self, events: &[DeviceEvent]) -> HubResult<usize> {
        let tuples = events.iter().map(DeviceEvent::to_tuple).collect();
        let reply = self.request(&Request::EventTx(tuples)).await?;
        count_of(expect_tag(reply, tags::EVENT_TX_RESULT)?)
    }

    /// Deliver device commands. Returns how many were delivered successfully.
    pub async fn send_commands(&self, commands: &[DeviceCommand]) -> HubResult<usize> {
        let raw = commands.iter().map(DeviceCommand::to_value).collect();
        let reply = self.request(&Request::CmdTx(raw)).await?;
        count_of(expect_tag(reply, tags::CMD_TX_RESULT)?)
    }

    /// Call one device method and return its result.
    pub async fn dev_rpc(&self, device: &str, method: &str, args: Vec<Value>) -> HubResult<Value> {
        let request = Request::DevRpc {
            device: device.to_string(),
            method: method.to_string(),
            args,
            kwargs: BTreeMap::new(),
        };
        let reply = self.request(&request).await?;
        expect_tag(reply, tags::DEV_RPC_RESULT)?
            .into_iter()
            .next()
            .ok_or_else(|| HubError::Protocol("DEV_RPC_RESULT without a value".to_string()))
    }

    /// `(name, class)` for every device on the hub.
    pub async fn device_list(&self) -> HubResult<Vec<(String, String)>> {
        let reply = self.request(&Request::GetDeviceList).await?;
        let payload = expect_tag(reply, tags::GET_DEV_LIST_RESULT)?;
        let entries = payload
            .get(1)
            .and_then(Value::as_list)
            .ok_or_else(|| HubError::Protocol("device list missing".to_string()))?;
        entries
            .iter()
            .map(|entry| match entry.as_list() {
                Some([Value::Str(name), Value::Str(class)]) => Ok((name.clone(), class.clone())),
                _ => Err(HubError::Protocol(format!("bad device list entry: {:?}", entry))),
            })
            .collect()
    }

    /// Call a remote method with positional arguments and return its result.
    pub async fn rpc(&self, name: &str, args: Vec<Value>) -> HubResult<Value> {
        self.rpc_with_kwargs(name, args, BTreeMap::new()).await
    }

    pub async fn rpc_with_kwargs(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> HubResult<Value> {
        let request = Request::Rpc {
            name: name.to_string(),
            args,
            kwargs,
        };
        let reply = self.request(&request).await?;
        let mut payload = expect_tag(reply, tags::RPC_RESULT)?;
        // (RPC_RESULT, name, value)
        if payload.len() < 2 {
            return Err(HubError::Protocol("RPC_RESULT without a value".to_string()));
        }
        Ok(payload.swap_remove(1))
    }

    /// Ask the hub to shut down.
    pub async fn stop_server(&self) -> HubResult<bool> {
        let reply = self.request(&Request::Stop).await?;
        let payload = expect_tag(reply, tags::STOP_IOHUB_SERVER_RESULT)?;
        Ok(payload.first().and_then(Value::as_bool).unwrap_or(false))
    }
}

/// Strip the expected reply tag, mapping error replies to errors.
fn expect_tag(reply: Value, expected: &str) -> HubResult<Vec<Value>> {
    let tag = reply_tag(&reply).map(str::to_string);
    let mut items = reply
        .into_list()
        .ok_or_else(|| HubError::Protocol("reply is not a list".to_string()))?;

    match tag.as_deref() {
        Some(tag) if tag == expected => {
            items.remove(0);
            Ok(items)
        }
        Some(tags::RPC_ERROR) => {
            let method = items.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
            let diagnostic = items
                .last()
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(HubError::Rpc { method, diagnostic })
        }
        Some(tags::IOHUB_ERROR) => {
            let detail: Vec<String> = items[1..]
                .iter()
                .map(|v| match v {
                    Value::Str(s) => s.clone(),
                    other => format!("{:?}", other),
                })
                .collect();
            Err(HubError::Rejected(detail.join(": ")))
        }
        other => Err(HubError::Protocol(format!(
            "expected {} reply, got {:?}",
            expected, other
        ))),
    }
}

fn count_of(payload: Vec<Value>) -> HubResult<usize> {
    payload
        .first()
        .and_then(Value::as_i64)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| HubError::Protocol("reply count missing".to_string()))
}

/// A hub running as a child process
pub struct HubProcess {
    child: Child,
    addr: SocketAddr,
    clock: MonotonicClock,
}

impl HubProcess {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Clock sharing the hub's epoch offset.
    pub fn clock(&self) -> MonotonicClock {
        self.clock
    }

    pub async fn client(&self, codec: Codec) -> HubResult<HubClient> {
        HubClient::connect(self.addr, codec).await
    }

    /// Wait for the hub to exit on its own.
    pub async fn wait(mut self) -> HubResult<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Terminate the hub, waiting briefly for a graceful exit first.
    pub async fn stop(mut self) -> HubResult<()> {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(Duration::from_secs(3), self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::info!(?status, "Hub exited");
            }
            Err(_) => {
                tracing::warn!("Hub did not exit gracefully, killing");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Launch a hub sharing `clock`'s epoch offset and wait for its status line.
pub async fn spawn_hub(
    binary: &Path,
    config: Option<&Path>,
    clock: MonotonicClock,
    startup_timeout: Duration,
) -> HubResult<HubProcess> {
    let mut command = Command::new(binary);
    command
        .arg("--epoch-offset")
        .arg(clock.epoch_offset().to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(config) = config {
        command.arg("--config").arg(config);
    }

    tracing::info!(binary = %binary.display(), offset = clock.epoch_offset(), "Starting hub");
    let mut child = command
        .spawn()
        .map_err(|e| HubError::Startup(format!("failed to spawn {}: {}", binary.display(), e)))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| HubError::Startup("hub stdout not captured".to_string()))?;

    let mut lines = BufReader::new(stdout).lines();
    let status = tokio::time::timeout(startup_timeout, async {
        while let Some(line) = lines.next_line().await? {
            if line.starts_with(READY_LINE) || line.starts_with(FAILED_LINE) {
                return Ok(Some(line));
            }
        }
        Ok::<_, std::io::Error>(None)
    })
    .await
    .map_err(|_| HubError::Timeout(format!("hub not ready within {:?}", startup_timeout)))??;

    match status {
        Some(line) => match line.strip_prefix(READY_LINE) {
            Some(addr) => {
                let addr = addr.trim().parse().map_err(|_| {
                    HubError::Startup(format!("unparseable ready line '{}'", line))
                })?;
                Ok(HubProcess { child, addr, clock })
            }
            None => {
                let reason = line.trim_start_matches(FAILED_LINE).trim().to_string();
                let code = child.wait().await.ok().and_then(|s| s.code());
                Err(HubError::Startup(format!("{} (exit code {:?})", reason, code)))
            }
        },
        None => {
            let code = child.wait().await.ok().and_then(|s| s.code());
            Err(HubError::Startup(format!(
                "hub exited without a status line (exit code {:?})",
                code
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;

    #[test]
    fn test_expect_tag_maps_errors() {
        let ok = expect_tag(tuple!["CMD_TX_RESULT", 2i64], tags::CMD_TX_RESULT).unwrap();
        assert_eq!(count_of(ok).unwrap(), 2);

        let err = expect_tag(
            tuple!["RPC_ERROR", "explode", Value::List(vec![]), Value::Map(Default::default()), "boom"],
            tags::RPC_RESULT,
        )
        .unwrap_err();
        match err {
            HubError::Rpc { method, diagnostic } => {
                assert_eq!(method, "explode");
                assert_eq!(diagnostic, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = expect_tag(tuple!["RPC_ERROR", "nope", "not found"], tags::RPC_RESULT).unwrap_err();
        assert!(matches!(err, HubError::Rpc { ref diagnostic, .. } if diagnostic == "not found"));

        let err = expect_tag(tuple!["IOHUB_ERROR", "DANCE", "request type not supported"], tags::GET_EVENTS_RESULT)
            .unwrap_err();
        assert!(matches!(err, HubError::Rejected(ref msg) if msg.contains("DANCE")));
    }

    #[tokio::test]
    async fn test_timeout_without_server() {
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = HubClient::connect(silent.local_addr().unwrap(), Codec::Json)
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(20));
        assert!(matches!(client.get_events().await, Err(HubError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let result = spawn_hub(
            Path::new("/nonexistent/iohub-server"),
            None,
            MonotonicClock::starting_now(),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(HubError::Startup(_))));
    }
}
