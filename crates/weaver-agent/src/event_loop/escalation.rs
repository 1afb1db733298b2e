use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use uuid::Uuid;

/// Lifecycle of one escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationState {
    Pending,
    Resolved(String),
    /// The waiting side gave up; no response will be delivered.
    Cancelled,
}

/// One-shot rendezvous for a sub-agent waiting on an external reply.
///
/// The first `inject_event` or `cancel` settles the receiver; later calls
/// are no-ops that return `false`.
#[derive(Debug)]
pub struct EscalationReceiver {
    id: String,
    state: watch::Sender<EscalationState>,
}

impl EscalationReceiver {
    pub fn new(id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(EscalationState::Pending);
        Self { id: id.into(), state }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> EscalationState {
        self.state.borrow().clone()
    }

    /// Deliver the response. Returns `false` if already settled.
    pub fn inject_event(&self, value: impl Into<String>) -> bool {
        let value = value.into();
        self.settle(EscalationState::Resolved(value))
    }

    /// Give up waiting. Returns `false` if already settled.
    pub fn cancel(&self) -> bool {
        self.settle(EscalationState::Cancelled)
    }

    fn settle(&self, next: EscalationState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == EscalationState::Pending {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Wait until settled. `None` means cancelled.
    pub async fn wait(&self) -> Option<String> {
        let mut rx = self.state.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                EscalationState::Resolved(value) => return Some(value),
                EscalationState::Cancelled => return None,
                EscalationState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

/// Run-scoped table of open escalations, shared by every node of a run.
#[derive(Debug, Default)]
pub struct EscalationRegistry {
    pending: Mutex<HashMap<String, Arc<EscalationReceiver>>>,
}

impl EscalationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Arc<EscalationReceiver>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new escalation for `node_id` with a fresh
    /// `<node-id>:escalation:<uuid>` id.
    pub fn register(&self, node_id: &str) -> Arc<EscalationReceiver> {
        let id = format!("{}:escalation:{}", node_id, Uuid::new_v4());
        let receiver = Arc::new(EscalationReceiver::new(id.clone()));
        self.pending().insert(id, receiver.clone());
        receiver
    }

    /// Resolve escalation `id` with `value`.
    /// Returns true if the escalation was open; the id is gone afterwards.
    pub fn inject(&self, id: &str, value: impl Into<String>) -> bool {
        let entry = self.pending().remove(id);
        match entry {
            Some(receiver) => receiver.inject_event(value),
            None => false,
        }
    }

    /// Cancel escalation `id`, waking its waiter with no value.
    pub fn cancel(&self, id: &str) -> bool {
        let entry = self.pending().remove(id);
        match entry {
            Some(receiver) => receiver.cancel(),
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<Arc<EscalationReceiver>> {
        self.pending().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending().contains_key(id)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Keeps an escalation registered while its waiter is alive. Dropping it,
/// including when the waiting future is dropped mid-wait, cancels the
/// receiver and removes the id from the registry.
pub struct PendingEscalation<'a> {
    registry: &'a EscalationRegistry,
    receiver: Arc<EscalationReceiver>,
}

impl<'a> PendingEscalation<'a> {
    pub fn open(registry: &'a EscalationRegistry, node_id: &str) -> Self {
        let receiver = registry.register(node_id);
        Self { registry, receiver }
    }

    pub fn receiver(&self) -> &EscalationReceiver {
        &self.receiver
    }
}

impl Drop for PendingEscalation<'_> {
    fn drop(&mut self) {
        self.receiver.cancel();
        self.registry.remove(self.receiver.id());
    }
}
