//! Outbound control requests and their correlation with responses.
//!
//! [`Correlator::send_request`] assigns a fresh correlation id, registers a
//! single-assignment slot in the [`PendingTable`], writes the
//! `control_request` envelope, and suspends the caller until one of:
//!
//! - the matching `control_response` arrives ([`Correlator::resolve`]),
//! - the per-request timeout elapses ([`AppError::RequestTimeout`]),
//! - the session closes or the process exits ([`Correlator::fail_all`]).
//!
//! Each caller waits on its own `oneshot`, so responses arriving out of
//! order never block one another.  A slot is removed exactly once: by the
//! response, by the timeout, by `fail_all`, or by the caller's future being
//! dropped.  Responses for ids that are no longer pending are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::models::envelope::{self, ControlOutcome, ControlResponse};
use crate::transport::writer::FrameWriter;
use crate::{AppError, Result};

// ── Pending table ────────────────────────────────────────────────────────────

/// One outstanding request.
#[derive(Debug)]
struct PendingSlot {
    tx: oneshot::Sender<Result<Value>>,
    subtype: String,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct TableState {
    slots: HashMap<String, PendingSlot>,
    /// Set once by `fail_all`; every later registration fails with it.
    closed: Option<AppError>,
}

/// Map from correlation id to pending result slot.
///
/// Every mutation is a single short critical section.
#[derive(Debug, Default)]
pub struct PendingTable {
    state: Mutex<TableState>,
}

impl PendingTable {
    fn insert(&self, id: String, slot: PendingSlot) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }
        if state.slots.contains_key(&id) {
            return Err(AppError::ProtocolViolation(format!(
                "correlation id '{id}' reused while still pending"
            )));
        }
        state.slots.insert(id, slot);
        Ok(())
    }

    fn remove(&self, id: &str) -> Option<PendingSlot> {
        self.state.lock().slots.remove(id)
    }

    fn drain(&self, err: AppError) -> Vec<PendingSlot> {
        let mut state = self.state.lock();
        if state.closed.is_none() {
            state.closed = Some(err);
        }
        state.slots.drain().map(|(_, slot)| slot).collect()
    }

    fn closed_error(&self) -> Option<AppError> {
        self.state.lock().closed.clone()
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Whether no request is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is still outstanding.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().slots.contains_key(id)
    }
}

/// Removes its slot when the awaiting future is dropped early.
struct SlotGuard<'a> {
    table: &'a PendingTable,
    id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.table.remove(self.id).is_some() {
            debug!(request_id = self.id, "correlator: pending slot released");
        }
    }
}

// ── Correlator ───────────────────────────────────────────────────────────────

/// Issues outbound control requests and routes their responses.
#[derive(Debug)]
pub struct Correlator {
    writer: FrameWriter,
    pending: Arc<PendingTable>,
    counter: AtomicU64,
}

impl Correlator {
    /// Create a correlator writing through `writer`.
    #[must_use]
    pub fn new(writer: FrameWriter) -> Self {
        Self {
            writer,
            pending: Arc::new(PendingTable::default()),
            counter: AtomicU64::new(0),
        }
    }

    /// The pending request table.
    #[must_use]
    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Generate the next correlation id: `req_<counter>_<8 hex>`.
    ///
    /// The counter makes ids unique for the lifetime of the session; the
    /// random suffix keeps ids from different sessions distinguishable.
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("req_{n}_{}", &suffix[..8])
    }

    /// Send a control request and wait for its response.
    ///
    /// `request` is the `request` object of the envelope and must carry a
    /// `subtype`.
    ///
    /// # Errors
    ///
    /// - [`AppError::ControlError`]: the agent answered with an error.
    /// - [`AppError::RequestTimeout`]: no answer within `timeout`.
    /// - [`AppError::SessionClosed`] / [`AppError::ProcessExited`]: the
    ///   session ended before an answer arrived, or had already ended.
    /// - [`AppError::BrokenPipe`]: the request could not be written.
    pub async fn send_request(&self, request: Value, timeout: Duration) -> Result<Value> {
        let subtype = request
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        let id = self.next_id();
        let span = info_span!("control", request_id = %id, %subtype);
        self.exchange(&id, subtype, request, timeout)
            .instrument(span)
            .await
    }

    async fn exchange(
        &self,
        id: &str,
        subtype: String,
        request: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;

        self.pending.insert(
            id.to_owned(),
            PendingSlot {
                tx,
                subtype: subtype.clone(),
                deadline,
            },
        )?;
        let _guard = SlotGuard {
            table: &self.pending,
            id,
        };

        debug!("correlator: sending control request");
        self.writer
            .send(&envelope::control_request(id, request))
            .await?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_dropped)) => Err(self.pending.closed_error().unwrap_or_else(|| {
                AppError::SessionClosed(format!("{subtype} request abandoned"))
            })),
            Err(_elapsed) => {
                warn!(?timeout, "correlator: control request timed out");
                Err(AppError::RequestTimeout { subtype, timeout })
            }
        }
    }

    /// Deliver an inbound `control_response` to its waiting caller.
    ///
    /// Returns `false` when the id is unknown, already resolved, timed out,
    /// or cancelled; such responses are logged and dropped.
    pub fn resolve(&self, response: ControlResponse) -> bool {
        let ControlResponse {
            request_id,
            outcome,
        } = response;

        let Some(slot) = self.pending.remove(&request_id) else {
            debug!(%request_id, "correlator: response for unknown or expired id, dropping");
            return false;
        };

        let result = match outcome {
            ControlOutcome::Success(payload) => Ok(payload),
            ControlOutcome::Error(message) => Err(AppError::ControlError(message)),
        };

        debug!(
            %request_id,
            subtype = %slot.subtype,
            remaining = ?slot.deadline.saturating_duration_since(Instant::now()),
            "correlator: response matched"
        );
        if slot.tx.send(result).is_err() {
            debug!(%request_id, subtype = %slot.subtype, "correlator: caller gone before response");
        }
        true
    }

    /// Resolve every pending request with `err` and refuse new ones.
    ///
    /// Idempotent: the first error recorded is the one later callers see.
    pub fn fail_all(&self, err: &AppError) {
        let slots = self.pending.drain(err.clone());
        let recorded = self.pending.closed_error().unwrap_or_else(|| err.clone());
        if !slots.is_empty() {
            debug!(count = slots.len(), error = %recorded, "correlator: failing pending requests");
        }
        for slot in slots {
            let _ = slot.tx.send(Err(recorded.clone()));
        }
    }
}
