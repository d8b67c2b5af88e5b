//! Event loop of the compute-node daemon.

use std::future::Future;

use imgstor_proto::{Delivery, PollTimer};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info};

use crate::controller::VmController;
use crate::error::VmError;

/// Serves `inbox` until it closes or `shutdown` resolves.
///
/// Runs startup recovery first. The merge-back poller is armed while sync
/// jobs are pending and stops once the queue is empty.
pub async fn run(
    controller: &VmController,
    mut inbox: UnboundedReceiver<Delivery>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), VmError> {
    let mut timer = PollTimer::new(controller.config().sync_check_interval());
    let pending = controller.recover()?;
    if pending > 0 {
        info!(pending, "sync jobs pending at startup");
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
                let delivery = match delivery {
                    Some(delivery) => delivery,
                    None => {
                        info!("inbox closed");
                        break;
                    }
                };
                if let Err(e) = controller.dispatch(&delivery).await {
                    error!(error = %e, "failed to publish reply");
                }
                if controller.store().has_sync_jobs() {
                    timer.arm();
                }
            }
            _ = timer.fired() => {
                let pass = controller.run_sync().await;
                debug!(?pass, "sync pass");
                if controller.store().has_sync_jobs() {
                    timer.rearm();
                } else {
                    debug!("sync queue empty; poller stopped");
                }
            }
        }
    }
    Ok(())
}
