//! Dispatcher: hands queued jobs to idle workers
//!
//! Idle workers publish a [`WorkerSlot`] (the sending half of a fresh oneshot
//! channel) into a bounded channel. The dispatcher takes one slot, pops one
//! job, and sends the job through that slot, so a worker can never hold two
//! jobs at once. While every worker is busy, jobs stay in the bounded queue.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::executor::QueuedJob;
use crate::admission::BoundedJobQueue;
use crate::cancel::CancelContext;
use crate::job::JobError;

/// An idle worker's offer to take exactly one job
pub(crate) struct WorkerSlot {
    pub worker_id: usize,
    pub tx: oneshot::Sender<QueuedJob>,
}

/// Run until the queue is closed and drained, or `ctx` is cancelled
///
/// Dropping `slots` on exit closes every outstanding slot, which is how idle
/// workers learn the pool is stopping.
pub(crate) async fn run_dispatcher(
    queue: Arc<BoundedJobQueue<QueuedJob>>,
    mut slots: mpsc::Receiver<WorkerSlot>,
    ctx: CancelContext,
) {
    debug!("Dispatcher started");

    loop {
        let slot = tokio::select! {
            slot = slots.recv() => match slot {
                Some(slot) => slot,
                None => break,
            },
            _ = ctx.done() => break,
        };

        let queued = match queue.pop(&ctx).await {
            Ok(Some(queued)) => queued,
            Ok(None) => {
                debug!("Queue closed and drained");
                break;
            }
            Err(e) => {
                debug!(reason = %e.reason, "Dispatcher cancelled");
                break;
            }
        };

        let worker_id = slot.worker_id;
        if let Err(queued) = slot.tx.send(queued) {
            // Workers only drop their slot when stopping
            warn!(worker_id, job_id = %queued.job.id, "Worker vanished before hand-off");
            queued.finish(Err(JobError::Dropped));
        }
    }

    debug!("Dispatcher exited");
}
