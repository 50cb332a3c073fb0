use crate::features::provisioning::service::CancelSignal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};

/// In-flight operations and their cancel flags.
///
/// Every operation is registered before its id is returned to the caller and
/// stays registered until its worker has persisted the terminal record.
pub struct OperationTracker {
    in_flight: Mutex<HashMap<String, watch::Sender<bool>>>,
    completions: watch::Sender<u64>,
}

impl Default for OperationTracker {
    fn default() -> Self {
        let (completions, _) = watch::channel(0);
        Self {
            in_flight: Mutex::new(HashMap::new()),
            completions,
        }
    }
}

/// Registration handle owned by a worker. Dropping it marks the operation
/// as no longer in flight.
pub struct TrackedOperation {
    operation_id: String,
    cancel: CancelSignal,
    tracker: Arc<OperationTracker>,
}

impl TrackedOperation {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn cancel_signal(&mut self) -> &mut CancelSignal {
        &mut self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

impl Drop for TrackedOperation {
    fn drop(&mut self) {
        self.tracker.finish(&self.operation_id);
    }
}

impl OperationTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<bool>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(self: &Arc<Self>, operation_id: &str) -> TrackedOperation {
        let (tx, rx) = watch::channel(false);
        self.lock().insert(operation_id.to_string(), tx);
        TrackedOperation {
            operation_id: operation_id.to_string(),
            cancel: rx,
            tracker: Arc::clone(self),
        }
    }

    /// Takes ownership of an operation nobody is working on. Returns `None`
    /// while a worker or another caller still holds it.
    pub fn adopt(self: &Arc<Self>, operation_id: &str) -> Option<TrackedOperation> {
        let mut in_flight = self.lock();
        if in_flight.contains_key(operation_id) {
            return None;
        }
        let (tx, rx) = watch::channel(false);
        in_flight.insert(operation_id.to_string(), tx);
        Some(TrackedOperation {
            operation_id: operation_id.to_string(),
            cancel: rx,
            tracker: Arc::clone(self),
        })
    }

    fn finish(&self, operation_id: &str) {
        self.lock().remove(operation_id);
        self.completions.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub fn is_in_flight(&self, operation_id: &str) -> bool {
        self.lock().contains_key(operation_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    /// Raises the cancel flag of an in-flight operation. Returns `false` if
    /// the operation is not in flight.
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.lock().get(operation_id) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Cancels everything in flight, returning how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let in_flight = self.lock();
        for tx in in_flight.values() {
            tx.send_replace(true);
        }
        in_flight.len()
    }

    /// Waits until every operation in flight at call time has finished.
    /// Operations registered afterwards are not waited for.
    pub async fn wait_for_in_flight(&self) {
        let mut completions = self.completions.subscribe();
        let mut pending: HashSet<String> = self.lock().keys().cloned().collect();

        loop {
            {
                let in_flight = self.lock();
                pending.retain(|id| in_flight.contains_key(id));
            }
            if pending.is_empty() {
                return;
            }
            if completions.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One async mutex per instance, serializing workers and removal.
#[derive(Default)]
pub struct InstanceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, instance_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(instance_id).lock_owned().await
    }

    /// Drops the entry of a removed instance.
    pub fn forget(&self, instance_id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(instance_id);
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
