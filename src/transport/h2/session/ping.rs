//! Keepalive and housekeeping task.
//!
//! Enforces the SETTINGS deadline, then sends keepalive PINGs and
//! periodically prunes stale pushes and idle data sub-queues.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::{SessionInner, SessionState};
use crate::error::Error;
use crate::transport::h2::frame::ErrorCode;
use crate::transport::h2::queue::Command;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

fn interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

pub(super) async fn run(inner: Arc<SessionInner>) {
    let timeout = inner.config.settings_timeout;
    tokio::select! {
        biased;
        _ = inner.master.cancelled() => return,
        _ = inner.settings_received.cancelled() => {}
        _ = tokio::time::sleep(timeout) => {
            inner.fail(Error::SettingsTimeout(timeout)).await;
            return;
        }
    }

    let mut keepalive = inner.config.ping_interval.map(interval);
    let mut maintenance = interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = inner.master.cancelled() => return,
            _ = tick(&mut keepalive) => send_keepalive(&inner),
            _ = maintenance.tick() => maintain(&inner),
        }
    }
}

fn send_keepalive(inner: &SessionInner) {
    if inner.state() != SessionState::Active {
        return;
    }
    let data: [u8; 8] = rand::random();
    tracing::trace!("keepalive ping {:02x?}", data);
    let _ = inner.enqueue(Command::Ping {
        data,
        ack: false,
        keepalive: true,
    });
}

fn maintain(inner: &SessionInner) {
    let now = Instant::now();
    for stream in inner
        .pushes
        .prune(now, inner.config.push_max_age, inner.config.push_max_count)
    {
        inner.reset_stream(&stream, ErrorCode::Cancel);
    }
    let dropped = inner.queue.prune_idle(now);
    if dropped > 0 {
        tracing::trace!("dropped {} idle data queues", dropped);
    }
}
