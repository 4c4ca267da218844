use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::provider::CallStatusReport;

/// Pending "call ended" notifications keyed by provider call id.
///
/// The executor registers before it starts waiting; the webhook handler
/// resolves. Whichever of webhook and status poll arrives first wins.
#[derive(Default)]
pub struct CallWaiters {
    pending: DashMap<String, oneshot::Sender<CallStatusReport>>,
}

impl CallWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, call_id: &str) -> oneshot::Receiver<CallStatusReport> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id.to_string(), tx);
        rx
    }

    /// Hand `report` to whoever waits on its call id. Returns `false` when no
    /// one is waiting (unknown call, or the executor already gave up).
    pub fn resolve(&self, report: CallStatusReport) -> bool {
        match self.pending.remove(&report.call_id) {
            Some((call_id, tx)) => {
                let delivered = tx.send(report).is_ok();
                debug!(%call_id, delivered, "call waiter resolved");
                delivered
            }
            None => false,
        }
    }

    pub fn cancel(&self, call_id: &str) {
        self.pending.remove(call_id);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
