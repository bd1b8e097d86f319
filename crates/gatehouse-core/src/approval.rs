//! Human-in-the-loop approval queue.
//!
//! Operations flagged for approval park here as tickets. The requesting
//! side awaits a decision through a watch channel; the operator side lists
//! pending tickets and settles them. A ticket settles exactly once: the
//! first decision wins and later decisions are no-ops.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::credential::{now_ms, OpClass};

/// How long settled tickets remain listable before garbage collection.
const SETTLED_RETENTION_MS: i64 = 300 * 1000;

// ---------------------------------------------------------------------------
// Tickets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalState {
    pub fn is_settled(self) -> bool {
        self != Self::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    /// Fingerprint of the requesting credential, never its secret.
    pub credential_fingerprint: String,
    pub op_class: OpClass,
    /// Display form of the target, for the operator deciding the ticket.
    pub target: String,
    pub state: ApprovalState,
    pub requested_at_ms: i64,
    pub expires_at_ms: i64,
    /// Set when the ticket settles.
    pub decided_at_ms: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("unknown approval ticket")]
    UnknownTicket,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct Entry {
    ticket: Ticket,
    tx: watch::Sender<ApprovalState>,
}

/// Shared approval queue. Waiters block on a per-ticket watch channel and
/// wake the moment a decision lands; no polling loop is involved.
pub struct ApprovalQueue {
    entries: Mutex<HashMap<Uuid, Entry>>,
    timeout: Duration,
}

impl ApprovalQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Park a new ticket. Returns its id for the operator side.
    pub fn submit(
        &self,
        credential_fingerprint: &str,
        op_class: OpClass,
        target: &str,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let requested_at_ms = now_ms();
        let ticket = Ticket {
            id,
            credential_fingerprint: credential_fingerprint.to_string(),
            op_class,
            target: target.to_string(),
            state: ApprovalState::Pending,
            requested_at_ms,
            expires_at_ms: requested_at_ms + self.timeout.as_millis() as i64,
            decided_at_ms: None,
        };
        let (tx, _rx) = watch::channel(ApprovalState::Pending);
        let mut entries = self.entries.lock().expect("approval queue lock poisoned");
        entries.insert(id, Entry { ticket, tx });
        id
    }

    /// Await the decision for `id`, up to the queue timeout. An undecided
    /// ticket expires when the timeout lapses. Settled entries past retention
    /// are swept on the way out, so the queue stays bounded even when no
    /// operator ever lists it.
    pub async fn await_decision(&self, id: Uuid) -> Result<ApprovalState, ApprovalError> {
        let mut rx = {
            let entries = self.entries.lock().expect("approval queue lock poisoned");
            let entry = entries.get(&id).ok_or(ApprovalError::UnknownTicket)?;
            entry.tx.subscribe()
        };

        let result = match tokio::time::timeout(self.timeout, rx.wait_for(|s| s.is_settled())).await
        {
            Ok(Ok(state)) => Ok(*state),
            // Sender dropped: the ticket was garbage collected underneath us.
            Ok(Err(_)) => Err(ApprovalError::UnknownTicket),
            Err(_elapsed) => {
                self.settle(id, ApprovalState::Expired);
                Ok(ApprovalState::Expired)
            }
        };
        drop(rx);
        self.gc();
        result
    }

    /// Settle a ticket from the operator side. Already-settled tickets are
    /// left untouched; the returned state is whatever the ticket holds
    /// afterwards.
    pub fn decide(&self, id: Uuid, approve: bool) -> Result<ApprovalState, ApprovalError> {
        let state = if approve {
            ApprovalState::Approved
        } else {
            ApprovalState::Denied
        };
        let mut entries = self.entries.lock().expect("approval queue lock poisoned");
        let entry = entries.get_mut(&id).ok_or(ApprovalError::UnknownTicket)?;
        if entry.ticket.state.is_settled() {
            return Ok(entry.ticket.state);
        }
        // Expire lazily: a decision arriving past the deadline loses to it.
        if now_ms() >= entry.ticket.expires_at_ms {
            settle_entry(entry, ApprovalState::Expired);
            return Ok(ApprovalState::Expired);
        }
        settle_entry(entry, state);
        Ok(state)
    }

    pub fn get(&self, id: Uuid) -> Option<Ticket> {
        let entries = self.entries.lock().expect("approval queue lock poisoned");
        entries.get(&id).map(|e| e.ticket.clone())
    }

    /// Pending tickets, oldest first. Stale ones are expired on the way.
    pub fn list_pending(&self) -> Vec<Ticket> {
        let now = now_ms();
        let mut entries = self.entries.lock().expect("approval queue lock poisoned");
        let mut pending: Vec<Ticket> = entries
            .values_mut()
            .filter_map(|entry| {
                if entry.ticket.state == ApprovalState::Pending && now >= entry.ticket.expires_at_ms
                {
                    settle_entry(entry, ApprovalState::Expired);
                }
                (entry.ticket.state == ApprovalState::Pending).then(|| entry.ticket.clone())
            })
            .collect();
        pending.sort_by_key(|t| t.requested_at_ms);
        pending
    }

    /// Drop settled tickets past the retention window.
    pub fn gc(&self) {
        let now = now_ms();
        let mut entries = self.entries.lock().expect("approval queue lock poisoned");
        entries.retain(|_, entry| {
            !entry.ticket.state.is_settled()
                || entry
                    .ticket
                    .decided_at_ms
                    .map_or(true, |t| now - t < SETTLED_RETENTION_MS)
        });
    }

    fn settle(&self, id: Uuid, state: ApprovalState) {
        let mut entries = self.entries.lock().expect("approval queue lock poisoned");
        if let Some(entry) = entries.get_mut(&id) {
            if !entry.ticket.state.is_settled() {
                settle_entry(entry, state);
            }
        }
    }
}

fn settle_entry(entry: &mut Entry, state: ApprovalState) {
    entry.ticket.state = state;
    entry.ticket.decided_at_ms = Some(now_ms());
    // send_replace stores the value even while no waiter is subscribed, so a
    // decision that lands before await_decision is still observed.
    entry.tx.send_replace(state);
}
