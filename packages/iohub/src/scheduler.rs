// Cooperative device scheduling
//
// One task per polled device plus one merge task, all on the hub's
// single-threaded runtime. Tasks only yield at their interval ticks, so a
// poll that blocks stalls every other task including the UDP responder.

use crate::error::HubResult;
use crate::hub::{DeviceSlot, EventHub};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Shortest interval the runtime's timer can honour
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub fn clamp_interval(requested: Duration) -> Duration {
    requested.max(MIN_INTERVAL)
}

/// Spawn one poller per device that has a poll interval.
pub fn spawn_pollers(hub: &Arc<EventHub>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    hub.devices()
        .iter()
        .filter_map(|slot| {
            let period = clamp_interval(slot.poll_interval()?);
            let hub = Arc::clone(hub);
            let slot = Arc::clone(slot);
            let cancel = cancel.clone();
            Some(tokio::spawn(run_poller(hub, slot, period, cancel)))
        })
        .collect()
}

async fn run_poller(
    hub: Arc<EventHub>,
    slot: Arc<DeviceSlot>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::debug!(device = %slot.name(), ?period, "Poller started");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = tick.tick() => {
                if !hub.poll_device(&slot) {
                    slot.disable();
                    tracing::error!(device = %slot.name(), "Device failed; polling stopped and device disabled");
                    break;
                }
            }
        }
    }
    tracing::debug!(device = %slot.name(), "Poller stopped");
}

/// Spawn the merge task. It stops on cancellation or on a fatal
/// persistence error, in which case it cancels every other task too.
pub fn spawn_merge(
    hub: &Arc<EventHub>,
    period: Duration,
    cancel: &CancellationToken,
) -> JoinHandle<HubResult<()>> {
    tokio::spawn(run_merge(Arc::clone(hub), clamp_interval(period), cancel.clone()))
}

async fn run_merge(hub: Arc<EventHub>, period: Duration, cancel: CancellationToken) -> HubResult<()> {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = tick.tick() => {
                if let Err(e) = hub.merge_tick() {
                    tracing::error!(error = %e, "Merge loop stopped");
                    cancel.cancel();
                    return Err(e);
                }
            }
        }
    }

    // Pick up whatever the pollers queued before they stopped.
    hub.merge_tick()?;
    Ok(())
}
