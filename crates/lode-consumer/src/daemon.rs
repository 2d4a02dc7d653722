//! Event-driven consumer daemon.
//!
//! The daemon runs one drive loop, then sleeps until either a relevant
//! change event arrives or the safety tick fires. Change events are
//! wakeup hints, not state: duplicates are coalesced by draining the
//! channel before the next pass, and a lagged subscription simply forces
//! an immediate re-run. A FAILED window parks the daemon until the
//! operator's reset lands as a change event.

use std::time::Duration;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::{Consumer, ConsumerError, Outcome};

/// Run the consumer forever, waking on change events with `poll_interval`
/// as the safety tick. Returns only when the change stream closes.
pub async fn run_daemon(
    consumer: &Consumer,
    poll_interval: Duration,
) -> Result<(), ConsumerError> {
    let mut events = consumer.store().subscribe();
    info!(poll_interval_secs = poll_interval.as_secs(), "consumer daemon started");
    loop {
        match consumer.run_once().await {
            Ok(Outcome::Drained { applied }) if applied > 0 => {
                info!(applied, "queue drained");
            }
            Ok(Outcome::Drained { .. }) => debug!("queue empty"),
            Ok(Outcome::AnotherOwner) => debug!("another runner owns the lease"),
            Ok(Outcome::Blocked { reason }) => debug!(%reason, "queue blocked"),
            Ok(Outcome::Failed { sort_key, error, .. }) => {
                error!(%sort_key, %error, "window failed; paused until operator reset");
            }
            Err(e) => warn!(error = %e, "consumer pass failed; will retry"),
        }

        // Sleep until a relevant event or the safety tick.
        let tick = tokio::time::sleep(poll_interval);
        tokio::pin!(tick);
        loop {
            tokio::select! {
                _ = &mut tick => break,
                event = events.recv() => match event {
                    Ok(event) if consumer.is_relevant(&event) => {
                        debug!(?event, "woken by change event");
                        break;
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "change stream lagged; re-running");
                        break;
                    }
                    Err(RecvError::Closed) => {
                        info!("change stream closed; daemon exiting");
                        return Ok(());
                    }
                },
            }
        }
        // Coalesce wakeups that piled up while we were applying.
        loop {
            match events.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => break,
            }
        }
    }
}
