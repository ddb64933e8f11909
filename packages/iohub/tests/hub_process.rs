use iohub::{spawn_hub, Codec, HubError, MonotonicClock};
use std::path::{Path, PathBuf};
use std::time::Duration;

const HUB_BINARY: &str = env!("CARGO_BIN_EXE_iohub-server");
const STARTUP: Duration = Duration::from_secs(10);

fn free_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("iohub.yaml");
    std::fs::write(&path, body).unwrap();
    path
}

fn startup_error(result: Result<iohub::HubProcess, HubError>) -> String {
    match result {
        Err(HubError::Startup(reason)) => reason,
        Err(other) => panic!("expected a startup failure, got {}", other),
        Ok(_) => panic!("hub started unexpectedly"),
    }
}

#[tokio::test]
async fn test_spawned_hub_shares_timebase_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let data_file = dir.path().join("data").join("events.jsonl");
    let config = write_config(
        dir.path(),
        &format!(
            r#"
port: {}
flush_every: 8
data_file: "{}"
devices:
  - name: sine
    poll_interval_ms: 1
    kind:
      type: synthetic
"#,
            free_port(),
            data_file.display()
        ),
    );

    let clock = MonotonicClock::starting_now();
    let hub = spawn_hub(Path::new(HUB_BINARY), Some(&config), clock, STARTUP)
        .await
        .unwrap();
    let client = hub.client(Codec::MsgPack).await.unwrap();

    let offset = client.rpc("getEpochOffset", vec![]).await.unwrap();
    assert_eq!(offset.as_f64().unwrap(), clock.epoch_offset());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let events = client.get_events().await.unwrap();
    assert!(!events.is_empty());
    let now = clock.now();
    assert!(events.iter().all(|e| e.hub_time > 0.0 && e.hub_time <= now));

    assert!(client.stop_server().await.unwrap());
    let status = tokio::time::timeout(Duration::from_secs(5), hub.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());

    let persisted = std::fs::read_to_string(&data_file).unwrap();
    let lines: Vec<&str> = persisted.lines().collect();
    assert!(lines.len() >= events.len());
    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first.as_array().unwrap().len(), 12);
}

#[tokio::test]
async fn test_bind_failure_exits_with_status_2() {
    let dir = tempfile::tempdir().unwrap();
    let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let config = write_config(dir.path(), &format!("port: {}\n", port));

    let reason = startup_error(
        spawn_hub(Path::new(HUB_BINARY), Some(&config), MonotonicClock::starting_now(), STARTUP).await,
    );
    assert!(reason.contains("binding"), "{}", reason);
    assert!(reason.contains("Some(2)"), "{}", reason);
}

#[tokio::test]
async fn test_invalid_config_exits_with_status_4() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
devices:
  - name: twin
    kind: {type: experiment}
  - name: twin
    kind: {type: experiment}
"#,
    );

    let reason = startup_error(
        spawn_hub(Path::new(HUB_BINARY), Some(&config), MonotonicClock::starting_now(), STARTUP).await,
    );
    assert!(reason.contains("twin"), "{}", reason);
    assert!(reason.contains("Some(4)"), "{}", reason);
}

#[tokio::test]
async fn test_unwritable_data_file_exits_with_status_3() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-directory");
    std::fs::write(&blocker, b"").unwrap();
    let config = write_config(
        dir.path(),
        &format!(
            "port: {}\ndata_file: \"{}\"\n",
            free_port(),
            blocker.join("events.jsonl").display()
        ),
    );

    let reason = startup_error(
        spawn_hub(Path::new(HUB_BINARY), Some(&config), MonotonicClock::starting_now(), STARTUP).await,
    );
    assert!(reason.contains("Some(3)"), "{}", reason);
}
