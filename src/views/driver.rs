//! Background task that keeps one view live
//!
//! The subscription is opened before the first snapshot is read, so no event
//! published during mount is lost. A failed snapshot is retried with backoff;
//! a failed reconcile or a `Lagged` notification falls back to a full resync.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{SnapshotSource, View};
use crate::bus::{EventBus, SubscriptionError};

const RESYNC_BACKOFF_START: Duration = Duration::from_millis(100);
const RESYNC_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Running view task. Dropping the handle cancels the view.
pub struct ViewHandle {
    name: &'static str,
    task: JoinHandle<()>,
    resyncs: Arc<AtomicU64>,
    mounted: watch::Receiver<bool>,
}

impl ViewHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Completed snapshots, including the initial mount
    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Wait until the initial snapshot has loaded
    pub async fn mounted(&mut self) {
        let _ = self.mounted.wait_for(|mounted| *mounted).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ViewHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Mount `view` and keep it reconciled until the bus closes or the handle drops
pub fn spawn_view<V: View>(mut view: V, source: Arc<dyn SnapshotSource>, bus: &EventBus) -> ViewHandle {
    let name = view.name();
    let mut subscription = bus.subscribe(view.topics());
    let resyncs = Arc::new(AtomicU64::new(0));
    let (mounted_tx, mounted_rx) = watch::channel(false);

    let counter = Arc::clone(&resyncs);
    let task = tokio::spawn(async move {
        resync(&mut view, source.as_ref(), &counter).await;
        let _ = mounted_tx.send(true);
        info!(view = name, "View mounted");

        loop {
            match subscription.recv().await {
                Ok(envelope) => match view.apply(&envelope.event, source.as_ref()).await {
                    Ok(outcome) => {
                        trace!(view = name, seq = envelope.seq, ?outcome, "Event reconciled");
                    }
                    Err(e) => {
                        warn!(view = name, seq = envelope.seq, error = %e, "Reconcile failed, resyncing");
                        resync(&mut view, source.as_ref(), &counter).await;
                    }
                },
                Err(SubscriptionError::Lagged(missed)) => {
                    info!(view = name, missed, "View lagged, resyncing");
                    resync(&mut view, source.as_ref(), &counter).await;
                }
                Err(SubscriptionError::Closed) => {
                    debug!(view = name, "Event bus closed, stopping view");
                    break;
                }
            }
        }
    });

    ViewHandle {
        name,
        task,
        resyncs,
        mounted: mounted_rx,
    }
}

async fn resync<V: View>(view: &mut V, source: &dyn SnapshotSource, counter: &AtomicU64) {
    let mut delay = RESYNC_BACKOFF_START;
    loop {
        match view.resync(source).await {
            Ok(()) => {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                warn!(view = view.name(), error = %e, retry_ms = delay.as_millis() as u64, "View resync failed");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RESYNC_BACKOFF_MAX);
            }
        }
    }
}
