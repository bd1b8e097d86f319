//! The gateway façade: every request passes through here in a fixed order.
//!
//! Pipeline: authenticate the bearer secret, admit through the rate limiter,
//! evaluate policy, park for approval when flagged, then perform the
//! operation. Each stage emits audit events; denials carry category-only
//! reasons back to the caller.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gatehouse_core::approval::{ApprovalError, ApprovalQueue, ApprovalState, Ticket};
use gatehouse_core::audit::{AuditEvent, AuditEventKind, AuditLevel, AuditSink};
use gatehouse_core::credential::{
    fingerprint, generate_secret, generate_token_id, now_ms, Credential, CredentialStore,
    CredentialSummary, OpClass, RateLimitConfig, Scope, StoreError,
};
use gatehouse_core::policy::{evaluate, Access, DenyReason};
use gatehouse_core::proto::{ExecuteResult, OpRequest, TokenCreateParams, TokenCreateResult};
use gatehouse_core::ratelimit::{RateLimited, RateLimiter};
use tracing::{info, warn};
use uuid::Uuid;

use crate::ops::{self, OpError};

/// How long an issued authorization stays valid before `perform` refuses it.
pub const AUTHORIZATION_TTL_MS: i64 = 60_000;

/// Fingerprint recorded for requests admitted under open mode.
const OPEN_MODE_FINGERPRINT: &str = "open-mode";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication failed")]
    Unauthenticated,

    #[error("{0}")]
    Denied(DenyReason),

    #[error("{0}")]
    RateLimited(RateLimited),

    #[error("approval timed out")]
    ApprovalTimeout,

    #[error("approval denied")]
    NotApproved,

    #[error("authorization expired")]
    AuthorizationExpired,

    #[error("unknown approval ticket")]
    UnknownTicket,

    #[error("credential store error: {0}")]
    Store(#[from] StoreError),

    #[error("operation failed: {0}")]
    OpFailed(#[from] OpError),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Denied(_) => "denied",
            Self::RateLimited(_) => "rate_limited",
            Self::ApprovalTimeout => "approval_timeout",
            Self::NotApproved => "not_approved",
            Self::AuthorizationExpired => "expired",
            Self::UnknownTicket => "unknown_ticket",
            Self::Store(_) => "store_unavailable",
            Self::OpFailed(_) => "op_failed",
            Self::BadRequest(_) => "bad_request",
        }
    }
}

impl From<ApprovalError> for GatewayError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::UnknownTicket => Self::UnknownTicket,
        }
    }
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// Proof that a request cleared the pipeline. Consumed by [`Gateway::perform`];
/// ownership makes it single-use, and a TTL bounds how long it can sit.
pub struct Authorization {
    request_id: Uuid,
    credential_fingerprint: String,
    op: OpRequest,
    issued_at_ms: i64,
}

impl Authorization {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct GatewayConfig {
    /// When set, every path target must normalize to inside this directory.
    pub base_dir: Option<PathBuf>,
    /// Admit requests without credentials while the store is empty. Explicit
    /// opt-in for first-run bootstrap; audited under a reserved fingerprint.
    pub open_mode: bool,
    pub approval_timeout: Duration,
    /// When set, path targets in audit records and approval tickets are cut
    /// to this many leading components.
    pub redact_depth: Option<usize>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            open_mode: false,
            approval_timeout: Duration::from_secs(30),
            redact_depth: None,
        }
    }
}

pub struct Gateway {
    store: CredentialStore,
    limiter: RateLimiter,
    approvals: ApprovalQueue,
    audit: Arc<dyn AuditSink>,
    base_dir: Option<PathBuf>,
    open_mode: bool,
    redact_depth: Option<usize>,
}

impl Gateway {
    pub fn new(store: CredentialStore, audit: Arc<dyn AuditSink>, config: GatewayConfig) -> Self {
        Self {
            store,
            limiter: RateLimiter::new(),
            approvals: ApprovalQueue::new(config.approval_timeout),
            audit,
            base_dir: config.base_dir,
            open_mode: config.open_mode,
            redact_depth: config.redact_depth,
        }
    }

    /// Target form used in audit records and approval tickets.
    fn audit_target(&self, target: &gatehouse_core::policy::Target) -> String {
        match (self.redact_depth, target) {
            (Some(keep), gatehouse_core::policy::Target::Path { path }) => {
                gatehouse_core::audit::redact_path(path, keep)
            }
            _ => target.summary(),
        }
    }

    /// Run the full pipeline and execute the operation.
    pub async fn execute(&self, secret: &str, op: OpRequest) -> Result<ExecuteResult, GatewayError> {
        let auth = self.authorize(secret, op).await?;
        self.perform(auth).await
    }

    /// Authenticate, rate-limit, evaluate, and (when flagged) gate the
    /// request on approval. On success the caller holds a single-use
    /// [`Authorization`].
    pub async fn authorize(
        &self,
        secret: &str,
        op: OpRequest,
    ) -> Result<Authorization, GatewayError> {
        let request_id = Uuid::new_v4();
        let op_class = op.op_class();
        let target = op.target();
        let target_display = self.audit_target(&target);

        let (cred, fp) = match self.authenticate(secret) {
            Ok(resolved) => resolved,
            Err(e) => {
                // The fingerprint of the presented secret is safe to record
                // and lets repeated failures be correlated.
                self.audit.emit(
                    AuditEvent::new(AuditEventKind::AuthFailure)
                        .with_request_id(request_id)
                        .with_fingerprint(fingerprint(secret))
                        .with_op_class(op_class)
                        .with_target(target_display),
                );
                return Err(e);
            }
        };

        let now = now_ms();
        if let Err(limited) =
            self.limiter
                .check(&cred.id, op_class, &cred.rate_limits, &cred.op_limits, now)
        {
            self.audit.emit(
                AuditEvent::new(AuditEventKind::RateLimited)
                    .with_request_id(request_id)
                    .with_fingerprint(fp.clone())
                    .with_op_class(op_class)
                    .with_target(target_display.clone())
                    .with_rate_limited(&limited),
            );
            return Err(GatewayError::RateLimited(limited));
        }

        let rules = self.store.snapshot().global_rules.clone();
        let access = evaluate(&cred, &rules, op_class, &target, self.base_dir.as_deref());

        self.audit.emit(
            AuditEvent::new(AuditEventKind::Decision)
                .with_request_id(request_id)
                .with_fingerprint(fp.clone())
                .with_op_class(op_class)
                .with_target(target_display.clone())
                .with_access(&access),
        );

        match access {
            Access::Allow => {}
            Access::Deny(reason) => return Err(GatewayError::Denied(reason)),
            Access::RequiresApproval => {
                let ticket_id = self.approvals.submit(&fp, op_class, &target_display);
                let state = self.approvals.await_decision(ticket_id).await?;
                match state {
                    ApprovalState::Approved => {
                        self.audit.emit(
                            AuditEvent::new(AuditEventKind::ApprovalGranted)
                                .with_request_id(request_id)
                                .with_approval_id(ticket_id)
                                .with_fingerprint(fp.clone())
                                .with_op_class(op_class)
                                .with_target(target_display.clone()),
                        );
                    }
                    ApprovalState::Denied => {
                        self.audit.emit(
                            AuditEvent::new(AuditEventKind::ApprovalDenied)
                                .with_request_id(request_id)
                                .with_approval_id(ticket_id)
                                .with_fingerprint(fp.clone())
                                .with_op_class(op_class)
                                .with_target(target_display.clone()),
                        );
                        return Err(GatewayError::NotApproved);
                    }
                    ApprovalState::Expired | ApprovalState::Pending => {
                        self.audit.emit(
                            AuditEvent::new(AuditEventKind::ApprovalDenied)
                                .with_request_id(request_id)
                                .with_approval_id(ticket_id)
                                .with_fingerprint(fp.clone())
                                .with_op_class(op_class)
                                .with_target(target_display.clone())
                                .with_detail("ticket expired undecided"),
                        );
                        return Err(GatewayError::ApprovalTimeout);
                    }
                }
            }
        }

        if fp != OPEN_MODE_FINGERPRINT {
            // Last-used bookkeeping must not fail the request.
            if let Err(e) = self.store.touch(&cred.id) {
                warn!("failed to persist last-used timestamp: {e}");
            }
        }

        Ok(Authorization {
            request_id,
            credential_fingerprint: fp,
            op,
            issued_at_ms: now_ms(),
        })
    }

    /// Perform a previously authorized operation.
    pub async fn perform(&self, auth: Authorization) -> Result<ExecuteResult, GatewayError> {
        if now_ms() - auth.issued_at_ms > AUTHORIZATION_TTL_MS {
            return Err(GatewayError::AuthorizationExpired);
        }

        let op_class = auth.op.op_class();
        let target_display = self.audit_target(&auth.op.target());
        let started = Instant::now();
        let outcome = ops::perform(&auth.op).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(result) => {
                self.audit.emit(
                    AuditEvent::new(AuditEventKind::Outcome)
                        .with_request_id(auth.request_id)
                        .with_fingerprint(auth.credential_fingerprint)
                        .with_op_class(op_class)
                        .with_target(target_display.clone())
                        .with_outcome("ok")
                        .with_latency_ms(latency_ms),
                );
                Ok(ExecuteResult {
                    request_id: auth.request_id,
                    result,
                })
            }
            Err(e) => {
                self.audit.emit(
                    AuditEvent::new(AuditEventKind::Outcome)
                        .with_request_id(auth.request_id)
                        .with_fingerprint(auth.credential_fingerprint)
                        .with_op_class(op_class)
                        .with_target(target_display)
                        .with_outcome("error")
                        .with_latency_ms(latency_ms)
                        .with_detail(e.to_string())
                        .with_level(AuditLevel::Error),
                );
                Err(GatewayError::OpFailed(e))
            }
        }
    }

    // -- admin plane --------------------------------------------------------

    pub fn list_tokens(&self, secret: &str) -> Result<Vec<CredentialSummary>, GatewayError> {
        self.require_admin(secret)?;
        Ok(self.store.list())
    }

    pub fn create_token(
        &self,
        params: TokenCreateParams,
    ) -> Result<TokenCreateResult, GatewayError> {
        self.require_admin(params.secret.as_str())?;
        if params.name.trim().is_empty() {
            return Err(GatewayError::BadRequest("token name must not be empty".into()));
        }
        if params.scopes.is_empty() {
            return Err(GatewayError::BadRequest("token needs at least one scope".into()));
        }

        let cred = Credential {
            id: generate_token_id(),
            name: params.name,
            secret: generate_secret(),
            scopes: params.scopes,
            path_allowlist: params.path_allowlist,
            path_denylist: params.path_denylist,
            command_allowlist: params.command_allowlist,
            command_denylist: params.command_denylist,
            rate_limits: params.rate_limits,
            op_limits: Default::default(),
            require_approval: params.require_approval,
            created_at_ms: now_ms(),
            expires_at_ms: params.expires_at_ms,
            last_used_ms: None,
            enabled: true,
        };
        let secret = cred.secret.clone();
        let summary = CredentialSummary::from(&cred);
        self.store.insert(cred)?;
        info!(id = %summary.id, name = %summary.name, "token created");
        Ok(TokenCreateResult {
            token: summary,
            secret: secret.into(),
        })
    }

    /// Replace a token's secret. Usage history is cleared so the new secret
    /// starts fresh.
    pub fn rotate_token(
        &self,
        secret: &str,
        id: &str,
    ) -> Result<TokenCreateResult, GatewayError> {
        self.require_admin(secret)?;
        let new_secret = self.store.rotate(id)?;
        self.limiter.forget(id);
        let summary = self
            .store
            .snapshot()
            .credentials
            .iter()
            .find(|c| c.id == id)
            .map(|c| CredentialSummary::from(c.as_ref()))
            .ok_or_else(|| StoreError::UnknownCredential(id.to_owned()))?;
        info!(id = %id, "token rotated");
        Ok(TokenCreateResult {
            token: summary,
            secret: new_secret.into(),
        })
    }

    pub fn disable_token(&self, secret: &str, id: &str) -> Result<(), GatewayError> {
        self.require_admin(secret)?;
        self.store.disable(id)?;
        self.limiter.forget(id);
        info!(id = %id, "token disabled");
        Ok(())
    }

    pub fn list_approvals(&self, secret: &str) -> Result<Vec<Ticket>, GatewayError> {
        self.require_admin(secret)?;
        self.approvals.gc();
        Ok(self.approvals.list_pending())
    }

    /// Settle an approval ticket. The parked request's waiter emits the
    /// audit event when it observes the decision.
    pub fn decide_approval(
        &self,
        secret: &str,
        id: Uuid,
        approve: bool,
    ) -> Result<ApprovalState, GatewayError> {
        self.require_admin(secret)?;
        let state = self.approvals.decide(id, approve)?;
        info!(ticket = %id, state = ?state, "approval decided");
        Ok(state)
    }

    // -- internals ----------------------------------------------------------

    /// Resolve a bearer secret. Fails closed on an empty store unless open
    /// mode was requested at startup.
    fn authenticate(&self, secret: &str) -> Result<(Arc<Credential>, String), GatewayError> {
        if self.store.is_empty() {
            if self.open_mode {
                return Ok((
                    Arc::new(open_mode_credential()),
                    OPEN_MODE_FINGERPRINT.to_string(),
                ));
            }
            return Err(GatewayError::Unauthenticated);
        }

        let cred = self
            .store
            .resolve(secret)
            .ok_or(GatewayError::Unauthenticated)?;
        if !cred.enabled || cred.is_expired(now_ms()) {
            return Err(GatewayError::Unauthenticated);
        }
        Ok((cred, fingerprint(secret)))
    }

    fn require_admin(&self, secret: &str) -> Result<Arc<Credential>, GatewayError> {
        let (cred, _fp) = self.authenticate(secret)?;
        if !cred.is_admin() {
            return Err(GatewayError::Denied(DenyReason::MissingScope {
                scope: Scope::Admin,
            }));
        }
        Ok(cred)
    }
}

/// The synthetic credential behind open mode. Admin so the first real token
/// can be created through the normal admin plane.
fn open_mode_credential() -> Credential {
    Credential {
        id: "open-mode".into(),
        name: "open mode".into(),
        secret: String::new(),
        scopes: BTreeSet::from([Scope::Admin]),
        path_allowlist: None,
        path_denylist: None,
        command_allowlist: None,
        command_denylist: None,
        rate_limits: RateLimitConfig::default(),
        op_limits: Default::default(),
        require_approval: BTreeSet::new(),
        created_at_ms: now_ms(),
        expires_at_ms: None,
        last_used_ms: None,
        enabled: true,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use gatehouse_core::audit::InMemoryAuditSink;
    use gatehouse_core::credential::{CredentialFile, GlobalRules};
    use gatehouse_core::ratelimit::Window;

    use super::*;

    const AGENT_SECRET: &str = "agent-secret-0123456789abcdef";
    const ADMIN_SECRET: &str = "admin-secret-0123456789abcdef";

    fn agent_credential(base: &std::path::Path) -> Credential {
        Credential {
            id: "tok_agent".into(),
            name: "agent".into(),
            secret: AGENT_SECRET.into(),
            scopes: BTreeSet::from([Scope::Read, Scope::Write, Scope::Exec]),
            path_allowlist: Some(vec![base.to_path_buf()]),
            path_denylist: None,
            command_allowlist: None,
            command_denylist: None,
            rate_limits: RateLimitConfig::default(),
            op_limits: HashMap::new(),
            require_approval: BTreeSet::new(),
            created_at_ms: now_ms(),
            expires_at_ms: None,
            last_used_ms: None,
            enabled: true,
        }
    }

    fn admin_credential() -> Credential {
        Credential {
            id: "tok_admin".into(),
            name: "admin".into(),
            secret: ADMIN_SECRET.into(),
            scopes: BTreeSet::from([Scope::Admin]),
            path_allowlist: None,
            path_denylist: None,
            command_allowlist: None,
            command_denylist: None,
            rate_limits: RateLimitConfig::default(),
            op_limits: HashMap::new(),
            require_approval: BTreeSet::new(),
            created_at_ms: now_ms(),
            expires_at_ms: None,
            last_used_ms: None,
            enabled: true,
        }
    }

    struct Fixture {
        gateway: Arc<Gateway>,
        audit: InMemoryAuditSink,
        _dir: tempfile::TempDir,
        base: PathBuf,
    }

    fn fixture_with(edit: impl FnOnce(&mut CredentialFile, &std::path::Path)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();

        let mut file = CredentialFile {
            tokens: vec![agent_credential(&base), admin_credential()],
            global_rules: GlobalRules::default(),
        };
        edit(&mut file, &base);

        let audit = InMemoryAuditSink::new();
        let gateway = Gateway::new(
            CredentialStore::in_memory(file),
            Arc::new(audit.clone()),
            GatewayConfig {
                base_dir: Some(base.clone()),
                open_mode: false,
                approval_timeout: Duration::from_secs(5),
                redact_depth: None,
            },
        );
        Fixture {
            gateway: Arc::new(gateway),
            audit,
            _dir: dir,
            base,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_, _| {})
    }

    #[tokio::test]
    async fn allowed_read_executes_and_audits() {
        let fx = fixture();
        let path = fx.base.join("notes.txt");
        std::fs::write(&path, "hello").unwrap();

        let result = fx
            .gateway
            .execute(AGENT_SECRET, OpRequest::FsRead { path })
            .await
            .unwrap();
        let gatehouse_core::proto::OpResult::FsRead { contents, .. } = result.result else {
            panic!("wrong result variant");
        };
        assert_eq!(contents, "hello");

        let decisions = fx.audit.events_of_kind(AuditEventKind::Decision);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].decision.as_deref(), Some("allow"));
        assert_eq!(
            decisions[0].credential_fingerprint.as_deref(),
            Some(fingerprint(AGENT_SECRET).as_str())
        );

        let outcomes = fx.audit.events_of_kind(AuditEventKind::Outcome);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].outcome.as_deref(), Some("ok"));
        assert_eq!(outcomes[0].request_id, decisions[0].request_id);
    }

    #[tokio::test]
    async fn traversal_outside_base_is_denied() {
        let fx = fixture();
        let sneaky = fx.base.join("..").join("escape.txt");

        let err = fx
            .gateway
            .execute(AGENT_SECRET, OpRequest::FsRead { path: sneaky })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Denied(_)));
        assert_eq!(err.code(), "denied");

        let decisions = fx.audit.events_of_kind(AuditEventKind::Decision);
        assert_eq!(decisions[0].decision.as_deref(), Some("deny"));
        // No outcome event: nothing executed.
        assert!(fx.audit.events_of_kind(AuditEventKind::Outcome).is_empty());
    }

    #[tokio::test]
    async fn wrong_secret_is_unauthenticated() {
        let fx = fixture();
        let err = fx
            .gateway
            .execute("not-a-secret", OpRequest::FsList { path: fx.base.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
        assert_eq!(err.code(), "unauthenticated");
    }

    #[tokio::test]
    async fn failed_authentication_is_audited() {
        let fx = fixture();
        fx.gateway
            .execute("not-a-secret", OpRequest::FsList { path: fx.base.clone() })
            .await
            .unwrap_err();

        let failures = fx.audit.events_of_kind(AuditEventKind::AuthFailure);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].level, AuditLevel::Warn);
        // The presented (unknown) secret is recorded as a fingerprint only.
        assert_eq!(
            failures[0].credential_fingerprint.as_deref(),
            Some(fingerprint("not-a-secret").as_str())
        );
    }

    #[tokio::test]
    async fn disabled_credential_is_unauthenticated() {
        let fx = fixture_with(|file, _| {
            file.tokens[0].enabled = false;
        });
        let err = fx
            .gateway
            .execute(AGENT_SECRET, OpRequest::FsList { path: fx.base.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn expired_credential_is_unauthenticated() {
        let fx = fixture_with(|file, _| {
            file.tokens[0].expires_at_ms = Some(now_ms() - 1000);
        });
        let err = fx
            .gateway
            .execute(AGENT_SECRET, OpRequest::FsList { path: fx.base.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn third_call_hits_rate_limit_and_audits() {
        let fx = fixture_with(|file, _| {
            file.tokens[0].rate_limits = RateLimitConfig {
                per_minute: Some(2),
                per_hour: None,
                per_day: None,
            };
        });
        std::fs::write(fx.base.join("f.txt"), "x").unwrap();

        for _ in 0..2 {
            fx.gateway
                .execute(AGENT_SECRET, OpRequest::FsRead { path: fx.base.join("f.txt") })
                .await
                .unwrap();
        }
        let err = fx
            .gateway
            .execute(AGENT_SECRET, OpRequest::FsRead { path: fx.base.join("f.txt") })
            .await
            .unwrap_err();
        let GatewayError::RateLimited(limited) = err else {
            panic!("expected rate limit, got something else");
        };
        assert_eq!(limited.window, Window::Minute);
        assert!(limited.retry_after_ms > 0);

        let limited_events = fx.audit.events_of_kind(AuditEventKind::RateLimited);
        assert_eq!(limited_events.len(), 1);
        assert_eq!(limited_events[0].retry_after_ms, Some(limited.retry_after_ms));
    }

    #[tokio::test]
    async fn admin_is_rate_limited_too() {
        let fx = fixture_with(|file, _| {
            file.tokens[1].rate_limits = RateLimitConfig {
                per_minute: Some(1),
                per_hour: None,
                per_day: None,
            };
        });
        fx.gateway
            .execute(ADMIN_SECRET, OpRequest::FsList { path: fx.base.clone() })
            .await
            .unwrap();
        let err = fx
            .gateway
            .execute(ADMIN_SECRET, OpRequest::FsList { path: fx.base.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited(_)));
    }

    #[tokio::test]
    async fn denied_approval_fails_with_two_audit_entries() {
        let fx = fixture_with(|file, _| {
            file.tokens[0].require_approval = BTreeSet::from([OpClass::FsWrite]);
        });
        let path = fx.base.join("out.txt");

        let exec = {
            let gateway = Arc::clone(&fx.gateway);
            tokio::spawn(async move {
                gateway
                    .execute(
                        AGENT_SECRET,
                        OpRequest::FsWrite {
                            path,
                            contents: "x".into(),
                        },
                    )
                    .await
            })
        };

        // Wait for the ticket to appear, then deny it.
        let ticket = loop {
            let pending = fx.gateway.list_approvals(ADMIN_SECRET).unwrap();
            if let Some(t) = pending.into_iter().next() {
                break t;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let state = fx
            .gateway
            .decide_approval(ADMIN_SECRET, ticket.id, false)
            .unwrap();
        assert_eq!(state, ApprovalState::Denied);

        let err = exec.await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::NotApproved));

        let decisions = fx.audit.events_of_kind(AuditEventKind::Decision);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].decision.as_deref(), Some("requires_approval"));
        let denials = fx.audit.events_of_kind(AuditEventKind::ApprovalDenied);
        assert_eq!(denials.len(), 1);
        assert_eq!(denials[0].approval_id, Some(ticket.id));
        assert_eq!(denials[0].request_id, decisions[0].request_id);
        assert!(!fx.base.join("out.txt").exists());
    }

    #[tokio::test]
    async fn granted_approval_executes_operation() {
        let fx = fixture_with(|file, _| {
            file.tokens[0].require_approval = BTreeSet::from([OpClass::FsWrite]);
        });
        let path = fx.base.join("approved.txt");

        let exec = {
            let gateway = Arc::clone(&fx.gateway);
            let path = path.clone();
            tokio::spawn(async move {
                gateway
                    .execute(
                        AGENT_SECRET,
                        OpRequest::FsWrite {
                            path,
                            contents: "approved".into(),
                        },
                    )
                    .await
            })
        };

        let ticket = loop {
            let pending = fx.gateway.list_approvals(ADMIN_SECRET).unwrap();
            if let Some(t) = pending.into_iter().next() {
                break t;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(ticket.op_class, OpClass::FsWrite);
        fx.gateway
            .decide_approval(ADMIN_SECRET, ticket.id, true)
            .unwrap();

        exec.await.unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "approved");
        assert_eq!(
            fx.audit.events_of_kind(AuditEventKind::ApprovalGranted).len(),
            1
        );
    }

    #[tokio::test]
    async fn empty_store_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(
            CredentialStore::in_memory(CredentialFile::default()),
            Arc::new(InMemoryAuditSink::new()),
            GatewayConfig::default(),
        );
        let err = gateway
            .execute("anything", OpRequest::FsList { path: dir.path().to_path_buf() })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn open_mode_admits_and_audits_reserved_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let audit = InMemoryAuditSink::new();
        let gateway = Gateway::new(
            CredentialStore::in_memory(CredentialFile::default()),
            Arc::new(audit.clone()),
            GatewayConfig {
                base_dir: None,
                open_mode: true,
                approval_timeout: Duration::from_secs(5),
                redact_depth: None,
            },
        );
        gateway
            .execute("", OpRequest::FsList { path: dir.path().to_path_buf() })
            .await
            .unwrap();

        let decisions = audit.events_of_kind(AuditEventKind::Decision);
        assert_eq!(
            decisions[0].credential_fingerprint.as_deref(),
            Some("open-mode")
        );
    }

    #[tokio::test]
    async fn open_mode_ends_once_a_token_exists() {
        let audit = InMemoryAuditSink::new();
        let gateway = Gateway::new(
            CredentialStore::in_memory(CredentialFile::default()),
            Arc::new(audit.clone()),
            GatewayConfig {
                base_dir: None,
                open_mode: true,
                approval_timeout: Duration::from_secs(5),
                redact_depth: None,
            },
        );

        // Bootstrap the first real token through the open-mode admin plane.
        let created = gateway
            .create_token(TokenCreateParams {
                secret: "".into(),
                name: "first".into(),
                scopes: BTreeSet::from([Scope::Read]),
                path_allowlist: None,
                path_denylist: None,
                command_allowlist: None,
                command_denylist: None,
                rate_limits: RateLimitConfig::default(),
                require_approval: BTreeSet::new(),
                expires_at_ms: None,
            })
            .unwrap();

        // Unknown secrets are now rejected.
        let dir = tempfile::tempdir().unwrap();
        let err = gateway
            .execute("", OpRequest::FsList { path: dir.path().to_path_buf() })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));

        // The minted secret works.
        gateway
            .execute(
                created.secret.as_str(),
                OpRequest::FsList { path: dir.path().to_path_buf() },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_admin_cannot_use_admin_plane() {
        let fx = fixture();
        let err = fx.gateway.list_tokens(AGENT_SECRET).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Denied(DenyReason::MissingScope { scope: Scope::Admin })
        ));
        assert!(fx
            .gateway
            .decide_approval(AGENT_SECRET, Uuid::new_v4(), true)
            .is_err());
    }

    #[tokio::test]
    async fn rotate_invalidates_old_secret() {
        let fx = fixture();
        let rotated = fx.gateway.rotate_token(ADMIN_SECRET, "tok_agent").unwrap();
        assert_ne!(rotated.secret.as_str(), AGENT_SECRET);

        let err = fx
            .gateway
            .execute(AGENT_SECRET, OpRequest::FsList { path: fx.base.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));

        fx.gateway
            .execute(
                rotated.secret.as_str(),
                OpRequest::FsList { path: fx.base.clone() },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disable_token_takes_effect_immediately() {
        let fx = fixture();
        fx.gateway.disable_token(ADMIN_SECRET, "tok_agent").unwrap();
        let err = fx
            .gateway
            .execute(AGENT_SECRET, OpRequest::FsList { path: fx.base.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn create_token_validates_input() {
        let fx = fixture();
        let err = fx
            .gateway
            .create_token(TokenCreateParams {
                secret: ADMIN_SECRET.into(),
                name: "  ".into(),
                scopes: BTreeSet::from([Scope::Read]),
                path_allowlist: None,
                path_denylist: None,
                command_allowlist: None,
                command_denylist: None,
                rate_limits: RateLimitConfig::default(),
                require_approval: BTreeSet::new(),
                expires_at_ms: None,
            })
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");

        let err = fx
            .gateway
            .create_token(TokenCreateParams {
                secret: ADMIN_SECRET.into(),
                name: "scopeless".into(),
                scopes: BTreeSet::new(),
                path_allowlist: None,
                path_denylist: None,
                command_allowlist: None,
                command_denylist: None,
                rate_limits: RateLimitConfig::default(),
                require_approval: BTreeSet::new(),
                expires_at_ms: None,
            })
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");
    }

    #[tokio::test]
    async fn stale_authorization_is_refused() {
        let fx = fixture();
        std::fs::write(fx.base.join("f.txt"), "x").unwrap();

        let mut auth = fx
            .gateway
            .authorize(AGENT_SECRET, OpRequest::FsRead { path: fx.base.join("f.txt") })
            .await
            .unwrap();
        auth.issued_at_ms -= AUTHORIZATION_TTL_MS + 1;

        let err = fx.gateway.perform(auth).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthorizationExpired));
        assert_eq!(err.code(), "expired");
    }

    #[tokio::test]
    async fn redact_depth_trims_audited_paths() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let deep = base.join("project").join("src").join("inner.rs");
        std::fs::create_dir_all(deep.parent().unwrap()).unwrap();
        std::fs::write(&deep, "x").unwrap();

        let audit = InMemoryAuditSink::new();
        let gateway = Gateway::new(
            CredentialStore::in_memory(CredentialFile {
                tokens: vec![agent_credential(&base)],
                global_rules: GlobalRules::default(),
            }),
            Arc::new(audit.clone()),
            GatewayConfig {
                base_dir: Some(base),
                open_mode: false,
                approval_timeout: Duration::from_secs(5),
                redact_depth: Some(2),
            },
        );

        gateway
            .execute(AGENT_SECRET, OpRequest::FsRead { path: deep })
            .await
            .unwrap();

        let decisions = audit.events_of_kind(AuditEventKind::Decision);
        let logged = decisions[0].target.as_deref().unwrap();
        assert!(logged.ends_with("/..."), "not redacted: {logged}");
        assert!(!logged.contains("inner.rs"));
    }

    #[tokio::test]
    async fn operation_failure_audits_error_outcome() {
        let fx = fixture();
        let err = fx
            .gateway
            .execute(AGENT_SECRET, OpRequest::FsRead { path: fx.base.join("ghost.txt") })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::OpFailed(_)));

        let outcomes = fx.audit.events_of_kind(AuditEventKind::Outcome);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].outcome.as_deref(), Some("error"));
        assert_eq!(outcomes[0].level, AuditLevel::Error);
    }
}
