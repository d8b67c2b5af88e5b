//! Event loop of the storage-node daemon.

use std::future::Future;

use imgstor_proto::{Delivery, PollTimer};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info};

use crate::coordinator::{Coordinator, PollOutcome};

/// Serves `inbox` until it closes or `shutdown` resolves.
///
/// The replication poller is armed while jobs are queued and stops once the
/// queue has drained. Jobs left over from a previous run restart from the
/// beginning.
pub async fn run(
    coordinator: &mut Coordinator,
    mut inbox: UnboundedReceiver<Delivery>,
    shutdown: impl Future<Output = ()>,
) {
    let mut timer = PollTimer::new(coordinator.config().poll_interval());
    let pending = coordinator.store().replication_jobs().len();
    if pending > 0 {
        info!(pending, "replication jobs pending at startup");
        timer.arm();
    }

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
            delivery = inbox.recv() => {
                let Some(delivery) = delivery else {
                    info!("inbox closed");
                    break;
                };
                if let Err(e) = coordinator.dispatch(&delivery).await {
                    error!(error = %e, "failed to publish reply");
                }
                if coordinator.store().has_replication_jobs() {
                    timer.arm();
                }
            }
            _ = timer.fired() => {
                let outcome = coordinator.poll().await;
                debug!(?outcome, "replication poll");
                let busy = matches!(
                    outcome,
                    PollOutcome::Started { .. } | PollOutcome::InFlight { .. }
                );
                if busy || coordinator.store().has_replication_jobs() {
                    timer.rearm();
                } else {
                    debug!("replication queue empty; poller stopped");
                }
            }
        }
    }
}
