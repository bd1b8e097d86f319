//! Audit event model and emission.
//!
//! Every decision, operation outcome, approval verdict, and rate-limit
//! rejection emits a structured audit event. Events carry correlation IDs
//! ([`AuditEvent::request_id`], [`AuditEvent::approval_id`]) for end-to-end
//! tracing.
//!
//! Secret values NEVER appear in audit events; credentials are identified
//! only by fingerprint.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credential::{now_ms, OpClass};
use crate::policy::{Access, DenyReason};
use crate::ratelimit::RateLimited;

// ---------------------------------------------------------------------------
// Audit event kind
// ---------------------------------------------------------------------------

/// The kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// The evaluator ruled on a request (allow, deny, or requires-approval).
    Decision,

    /// An operation finished executing (success or failure).
    Outcome,

    /// An operator approved a parked ticket.
    ApprovalGranted,

    /// An operator denied a parked ticket, or it expired undecided.
    ApprovalDenied,

    /// A request was rejected by the rate limiter.
    RateLimited,

    /// A presented secret failed authentication (unknown, disabled, or
    /// expired credential).
    AuthFailure,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Decision => "decision",
            Self::Outcome => "outcome",
            Self::ApprovalGranted => "approval.granted",
            Self::ApprovalDenied => "approval.denied",
            Self::RateLimited => "rate.limited",
            Self::AuthFailure => "auth.failure",
        };
        write!(f, "{s}")
    }
}

/// Severity level for audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Default severity based on event kind.
fn default_level_for_kind(kind: AuditEventKind) -> AuditLevel {
    match kind {
        AuditEventKind::ApprovalDenied
        | AuditEventKind::RateLimited
        | AuditEventKind::AuthFailure => AuditLevel::Warn,
        _ => AuditLevel::Info,
    }
}

// ---------------------------------------------------------------------------
// Audit event
// ---------------------------------------------------------------------------

/// A structured audit event. One of these serializes to one JSON line in the
/// persistent log.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier.
    pub event_id: Uuid,

    /// Monotonically increasing sequence number assigned by the sink.
    pub sequence_number: u64,

    /// UTC timestamp in milliseconds since epoch.
    pub ts_utc_ms: i64,

    pub level: AuditLevel,
    pub kind: AuditEventKind,

    /// Correlation: end-to-end request identifier.
    pub request_id: Option<Uuid>,

    /// Correlation: approval ticket identifier.
    pub approval_id: Option<Uuid>,

    /// Truncated hash of the acting credential's secret. Never the secret.
    pub credential_fingerprint: Option<String>,

    pub op_class: Option<OpClass>,

    /// Display form of the operation target.
    pub target: Option<String>,

    /// Evaluator verdict, for decision events: `"allow"`, `"deny"`,
    /// `"requires_approval"`.
    pub decision: Option<String>,

    /// Category-only denial reason, when the decision was a deny.
    pub deny_reason: Option<DenyReason>,

    /// Outcome string for outcome events: `"ok"` or `"error"`.
    pub outcome: Option<String>,

    /// Retry hint for rate-limit events.
    pub retry_after_ms: Option<i64>,

    pub latency_ms: Option<i64>,

    /// Human-readable detail message. Must never carry secret material.
    pub detail: Option<String>,
}

// Custom Debug to keep accidental leakage out of log lines.
impl fmt::Debug for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditEvent")
            .field("event_id", &self.event_id)
            .field("sequence_number", &self.sequence_number)
            .field("kind", &self.kind)
            .field("request_id", &self.request_id)
            .field("credential_fingerprint", &self.credential_fingerprint)
            .field("op_class", &self.op_class)
            .field("decision", &self.decision)
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl AuditEvent {
    /// Create a new event of the given kind. Timestamp and event id are set
    /// automatically.
    pub fn new(kind: AuditEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            sequence_number: 0,
            ts_utc_ms: now_ms(),
            level: default_level_for_kind(kind),
            kind,
            request_id: None,
            approval_id: None,
            credential_fingerprint: None,
            op_class: None,
            target: None,
            decision: None,
            deny_reason: None,
            outcome: None,
            retry_after_ms: None,
            latency_ms: None,
            detail: None,
        }
    }

    pub fn with_request_id(mut self, id: Uuid) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn with_approval_id(mut self, id: Uuid) -> Self {
        self.approval_id = Some(id);
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.credential_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_op_class(mut self, op_class: OpClass) -> Self {
        self.op_class = Some(op_class);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Record the evaluator verdict. Denials also capture the category
    /// reason and raise the level to warn.
    pub fn with_access(mut self, access: &Access) -> Self {
        match access {
            Access::Allow => self.decision = Some("allow".into()),
            Access::Deny(reason) => {
                self.decision = Some("deny".into());
                self.deny_reason = Some(reason.clone());
                self.level = AuditLevel::Warn;
            }
            Access::RequiresApproval => self.decision = Some("requires_approval".into()),
        }
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn with_rate_limited(mut self, limited: &RateLimited) -> Self {
        self.retry_after_ms = Some(limited.retry_after_ms);
        self.detail = Some(limited.to_string());
        self
    }

    pub fn with_latency_ms(mut self, ms: i64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_level(mut self, level: AuditLevel) -> Self {
        self.level = level;
        self
    }
}

/// Truncate a path to its leading `keep` components for audit records, so
/// deep project-internal structure stays out of the log.
pub fn redact_path(path: &Path, keep: usize) -> String {
    let components: Vec<_> = path.components().collect();
    if components.len() <= keep {
        return path.display().to_string();
    }
    let kept: PathBuf = components.into_iter().take(keep).collect();
    let kept = kept.display().to_string();
    if kept.ends_with('/') {
        format!("{kept}...")
    } else {
        format!("{kept}/...")
    }
}

// ---------------------------------------------------------------------------
// Audit sink trait
// ---------------------------------------------------------------------------

/// Trait for emitting audit events.
///
/// Implementations must not block the caller. I/O-bound backends buffer
/// events internally and flush from a background thread.
pub trait AuditSink: Send + Sync + fmt::Debug {
    /// Emit an audit event. Must not block.
    fn emit(&self, event: AuditEvent);
}

// ---------------------------------------------------------------------------
// In-memory sink (for testing)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct InMemoryState {
    events: Vec<AuditEvent>,
    next_sequence: u64,
}

/// An in-memory sink that stores events in a `Vec` behind a mutex. Assigns
/// monotonically increasing sequence numbers. Useful for testing.
#[derive(Debug, Clone)]
pub struct InMemoryAuditSink {
    state: std::sync::Arc<std::sync::Mutex<InMemoryState>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            state: std::sync::Arc::new(std::sync::Mutex::new(InMemoryState {
                events: Vec::new(),
                next_sequence: 0,
            })),
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.state
            .lock()
            .expect("audit mutex poisoned")
            .events
            .clone()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("audit mutex poisoned")
            .events
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn events_of_kind(&self, kind: AuditEventKind) -> Vec<AuditEvent> {
        self.state
            .lock()
            .expect("audit mutex poisoned")
            .events
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, mut event: AuditEvent) {
        let mut state = self.state.lock().expect("audit mutex poisoned");
        event.sequence_number = state.next_sequence;
        state.next_sequence += 1;
        state.events.push(event);
    }
}

// ---------------------------------------------------------------------------
// Tracing sink
// ---------------------------------------------------------------------------

/// A sink that logs events through the `tracing` crate. Used when no
/// persistent log is configured.
#[derive(Debug)]
pub struct TracingAuditSink {
    next_sequence: AtomicU64,
}

impl TracingAuditSink {
    pub fn new() -> Self {
        Self {
            next_sequence: AtomicU64::new(0),
        }
    }
}

impl Default for TracingAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for TracingAuditSink {
    fn emit(&self, mut event: AuditEvent) {
        event.sequence_number = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            event_id = %event.event_id,
            sequence_number = event.sequence_number,
            kind = %event.kind,
            request_id = ?event.request_id,
            fingerprint = ?event.credential_fingerprint,
            op_class = ?event.op_class,
            decision = ?event.decision,
            outcome = ?event.outcome,
            "audit event"
        );
    }
}

// ---------------------------------------------------------------------------
// JSONL sink
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit sink error: {0}")]
    Other(String),
}

/// A persistent audit sink backed by an append-only JSON Lines file.
///
/// Events are sent through a bounded channel and written by a dedicated
/// background thread so emission never blocks the request pipeline. When the
/// channel is full, events are dropped rather than stalling a request.
pub struct JsonlAuditSink {
    sender: std::sync::mpsc::SyncSender<AuditEvent>,
    next_sequence: AtomicU64,
    writer_handle: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl fmt::Debug for JsonlAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlAuditSink")
            .field("next_sequence", &self.next_sequence.load(Ordering::Relaxed))
            .finish()
    }
}

impl JsonlAuditSink {
    /// Open (or create) the audit log at `path` in append mode.
    pub fn new(path: PathBuf) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Fail fast if the file cannot be opened; the writer thread reopens
        // its own handle.
        let probe = OpenOptions::new().create(true).append(true).open(&path)?;
        drop(probe);

        let (sender, receiver) = std::sync::mpsc::sync_channel::<AuditEvent>(4096);

        let writer_path = path.clone();
        let writer_handle = std::thread::Builder::new()
            .name("audit-writer".into())
            .spawn(move || {
                Self::writer_loop(&writer_path, receiver);
            })
            .map_err(|e| AuditError::Other(format!("failed to spawn writer thread: {e}")))?;

        Ok(Self {
            sender,
            next_sequence: AtomicU64::new(0),
            writer_handle: std::sync::Mutex::new(Some(writer_handle)),
        })
    }

    /// Background writer loop. Drains the channel and appends events as JSON
    /// lines, flushing after each drained batch.
    fn writer_loop(path: &Path, receiver: std::sync::mpsc::Receiver<AuditEvent>) {
        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("audit writer failed to open log: {e}");
                return;
            }
        };
        let mut writer = BufWriter::new(file);

        while let Ok(event) = receiver.recv() {
            Self::write_line(&mut writer, &event);

            // Drain any additional pending events without blocking.
            while let Ok(event) = receiver.try_recv() {
                Self::write_line(&mut writer, &event);
            }

            if let Err(e) = writer.flush() {
                tracing::error!("audit writer flush failed: {e}");
            }
        }
        let _ = writer.flush();
    }

    fn write_line(writer: &mut BufWriter<std::fs::File>, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(line) => {
                if let Err(e) = writeln!(writer, "{line}") {
                    tracing::error!("audit writer append failed: {e}");
                }
            }
            Err(e) => tracing::error!("audit event serialization failed: {e}"),
        }
    }

    /// Read a JSONL audit log back into events. Lines that fail to parse are
    /// skipped with a warning, so a torn final line cannot poison the read.
    pub fn read_log(path: &Path) -> Result<Vec<AuditEvent>, AuditError> {
        let contents = std::fs::read_to_string(path)?;
        let mut events = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("skipping unparseable audit line: {e}"),
            }
        }
        Ok(events)
    }
}

impl AuditSink for JsonlAuditSink {
    fn emit(&self, mut event: AuditEvent) {
        event.sequence_number = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        // Non-blocking send. If the channel is full, drop the event.
        let _ = self.sender.try_send(event);
    }
}

impl Drop for JsonlAuditSink {
    fn drop(&mut self) {
        // Swap in a dummy sender to close the channel, then join the writer
        // so buffered events reach disk.
        let (new_sender, _) = std::sync::mpsc::sync_channel(1);
        let _ = std::mem::replace(&mut self.sender, new_sender);

        if let Ok(mut guard) = self.writer_handle.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::OpClass;
    use crate::policy::DenyReason;
    use crate::ratelimit::Window;

    #[test]
    fn builder_sets_fields() {
        let id = Uuid::new_v4();
        let event = AuditEvent::new(AuditEventKind::Decision)
            .with_request_id(id)
            .with_fingerprint("abcd1234ef56")
            .with_op_class(OpClass::FsRead)
            .with_target("/tmp/notes.txt")
            .with_access(&Access::Allow)
            .with_latency_ms(3);

        assert_eq!(event.kind, AuditEventKind::Decision);
        assert_eq!(event.request_id, Some(id));
        assert_eq!(event.credential_fingerprint.as_deref(), Some("abcd1234ef56"));
        assert_eq!(event.op_class, Some(OpClass::FsRead));
        assert_eq!(event.decision.as_deref(), Some("allow"));
        assert_eq!(event.latency_ms, Some(3));
        assert_eq!(event.level, AuditLevel::Info);
    }

    #[test]
    fn deny_raises_level_and_records_reason() {
        let event = AuditEvent::new(AuditEventKind::Decision)
            .with_access(&Access::Deny(DenyReason::PathDenied));
        assert_eq!(event.decision.as_deref(), Some("deny"));
        assert_eq!(event.deny_reason, Some(DenyReason::PathDenied));
        assert_eq!(event.level, AuditLevel::Warn);
    }

    #[test]
    fn default_levels() {
        assert_eq!(
            default_level_for_kind(AuditEventKind::RateLimited),
            AuditLevel::Warn
        );
        assert_eq!(
            default_level_for_kind(AuditEventKind::ApprovalDenied),
            AuditLevel::Warn
        );
        assert_eq!(
            default_level_for_kind(AuditEventKind::Outcome),
            AuditLevel::Info
        );
    }

    #[test]
    fn kind_display() {
        assert_eq!(format!("{}", AuditEventKind::Decision), "decision");
        assert_eq!(format!("{}", AuditEventKind::Outcome), "outcome");
        assert_eq!(
            format!("{}", AuditEventKind::ApprovalGranted),
            "approval.granted"
        );
        assert_eq!(
            format!("{}", AuditEventKind::ApprovalDenied),
            "approval.denied"
        );
        assert_eq!(format!("{}", AuditEventKind::RateLimited), "rate.limited");
        assert_eq!(format!("{}", AuditEventKind::AuthFailure), "auth.failure");
    }

    #[test]
    fn in_memory_sink_sequences_events() {
        let sink = InMemoryAuditSink::new();
        assert!(sink.is_empty());

        sink.emit(AuditEvent::new(AuditEventKind::Decision));
        sink.emit(AuditEvent::new(AuditEventKind::Outcome));
        sink.emit(AuditEvent::new(AuditEventKind::RateLimited));

        assert_eq!(sink.len(), 3);
        let events = sink.events();
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence_number, i as u64);
        }
        assert_eq!(sink.events_of_kind(AuditEventKind::Outcome).len(), 1);
    }

    #[test]
    fn rate_limited_event_carries_retry_hint() {
        let limited = RateLimited {
            window: Window::Minute,
            limit: 5,
            retry_after_ms: 12_345,
            op_class: None,
        };
        let event = AuditEvent::new(AuditEventKind::RateLimited).with_rate_limited(&limited);
        assert_eq!(event.retry_after_ms, Some(12_345));
        assert!(event.detail.unwrap().contains("retry in 12345ms"));
    }

    #[test]
    fn debug_is_safe_for_detail() {
        let event = AuditEvent::new(AuditEventKind::Outcome)
            .with_detail("output contained password=hunter2");
        let dbg = format!("{event:?}");
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn tracing_sink_does_not_panic() {
        let sink = TracingAuditSink::new();
        sink.emit(AuditEvent::new(AuditEventKind::Decision));
        sink.emit(
            AuditEvent::new(AuditEventKind::Outcome)
                .with_outcome("error")
                .with_latency_ms(5),
        );
        assert_eq!(sink.next_sequence.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn jsonl_sink_round_trips_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let sink = JsonlAuditSink::new(path.clone()).unwrap();
        sink.emit(
            AuditEvent::new(AuditEventKind::Decision)
                .with_fingerprint("abcd1234ef56")
                .with_op_class(OpClass::Exec)
                .with_target("git status")
                .with_access(&Access::Allow),
        );
        sink.emit(
            AuditEvent::new(AuditEventKind::Outcome)
                .with_outcome("ok")
                .with_latency_ms(17),
        );
        // Drop flushes the writer thread.
        drop(sink);

        let events = JsonlAuditSink::read_log(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, AuditEventKind::Decision);
        assert_eq!(events[0].sequence_number, 0);
        assert_eq!(events[0].decision.as_deref(), Some("allow"));
        assert_eq!(events[1].kind, AuditEventKind::Outcome);
        assert_eq!(events[1].sequence_number, 1);
    }

    #[test]
    fn jsonl_sink_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let sink = JsonlAuditSink::new(path.clone()).unwrap();
        sink.emit(AuditEvent::new(AuditEventKind::Decision));
        drop(sink);

        let sink = JsonlAuditSink::new(path.clone()).unwrap();
        sink.emit(AuditEvent::new(AuditEventKind::Outcome));
        drop(sink);

        let events = JsonlAuditSink::read_log(&path).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn read_log_skips_torn_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let sink = JsonlAuditSink::new(path.clone()).unwrap();
        sink.emit(AuditEvent::new(AuditEventKind::Decision));
        drop(sink);

        // Simulate a torn write at the end of the file.
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{\"event_id\":\"truncat");
        std::fs::write(&path, contents).unwrap();

        let events = JsonlAuditSink::read_log(&path).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn redact_path_keeps_leading_components() {
        let path = Path::new("/home/user/project/src/secret/module.rs");
        assert_eq!(redact_path(path, 3), "/home/user/...");
        assert_eq!(redact_path(path, 1), "/...");
        // Shallow paths pass through untouched.
        assert_eq!(redact_path(Path::new("/tmp/x"), 5), "/tmp/x");
    }

    #[test]
    fn jsonl_line_never_contains_secret_field() {
        let event = AuditEvent::new(AuditEventKind::Decision).with_fingerprint("abcd1234ef56");
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains("credential_fingerprint"));
        assert!(!line.contains("\"secret\""));
    }
}
