//! Credential model and store.
//!
//! A credential binds an opaque bearer secret to a policy: scopes, path and
//! command allow/denylists, rate limits, and the set of operation classes that
//! must pass through the approval queue.
//!
//! The store is snapshot-on-read: readers grab an `Arc` to an immutable
//! snapshot without contending with administrative mutations, which build a
//! new snapshot and swap it in under a short write lock. Persistence is
//! atomic (write-to-temp-then-rename) with the prior version retained as a
//! `.bak` file.
//!
//! Secret values never appear in logs, listings, or audit records; only the
//! [`fingerprint`] does.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

// ---------------------------------------------------------------------------
// Scopes and operation classes
// ---------------------------------------------------------------------------

/// A named permission bit a credential may hold.
///
/// `Admin` implies every other scope.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Read,
    Write,
    #[serde(rename = "write:destructive")]
    WriteDestructive,
    Exec,
    #[serde(rename = "exec:privileged")]
    ExecPrivileged,
    Admin,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::WriteDestructive => "write:destructive",
            Self::Exec => "exec",
            Self::ExecPrivileged => "exec:privileged",
            Self::Admin => "admin",
        };
        write!(f, "{s}")
    }
}

/// The class of a gated operation. Closed set, so the evaluator's match
/// over these is exhaustive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OpClass {
    FsList,
    FsRead,
    FsWrite,
    FsMkdir,
    FsDelete,
    Exec,
}

impl OpClass {
    /// The scope a credential must hold to perform this class of operation.
    pub fn required_scope(self) -> Scope {
        match self {
            Self::FsList | Self::FsRead => Scope::Read,
            Self::FsWrite | Self::FsMkdir => Scope::Write,
            Self::FsDelete => Scope::WriteDestructive,
            Self::Exec => Scope::Exec,
        }
    }
}

impl fmt::Display for OpClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FsList => "fs_list",
            Self::FsRead => "fs_read",
            Self::FsWrite => "fs_write",
            Self::FsMkdir => "fs_mkdir",
            Self::FsDelete => "fs_delete",
            Self::Exec => "exec",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Rate limit configuration
// ---------------------------------------------------------------------------

/// Request caps per sliding window. A zero or absent cap means unlimited for
/// that window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_day: Option<u32>,
}

impl RateLimitConfig {
    /// True if no window carries an effective cap.
    pub fn is_unlimited(&self) -> bool {
        !matches!(self.per_minute, Some(n) if n > 0)
            && !matches!(self.per_hour, Some(n) if n > 0)
            && !matches!(self.per_day, Some(n) if n > 0)
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// A credential: a bearer secret bound to a policy.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Stable identifier, e.g. `"tok_9f2c..."`. Never rotates.
    pub id: String,

    /// Human-readable name for listings and audit detail.
    pub name: String,

    /// The opaque bearer secret. Compared in constant time; never logged.
    pub secret: String,

    /// Scopes this credential holds.
    pub scopes: BTreeSet<Scope>,

    /// Absolute path prefixes this credential may target. `None` means all
    /// paths are permitted except denylisted ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_allowlist: Option<Vec<PathBuf>>,

    /// Absolute path prefixes this credential may never target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_denylist: Option<Vec<PathBuf>>,

    /// Program names this credential may execute. `None` means any program
    /// except denylisted ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_allowlist: Option<Vec<String>>,

    /// Program names, or literal prefixes of the full argument vector, this
    /// credential may never execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_denylist: Option<Vec<String>>,

    /// Credential-wide rate limits, applied to every operation class.
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Per-operation-class rate limit overrides, checked in addition to the
    /// credential-wide limits.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub op_limits: HashMap<OpClass, RateLimitConfig>,

    /// Operation classes that must pass through the approval queue even when
    /// policy otherwise allows them.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub require_approval: BTreeSet<OpClass>,

    /// UTC creation time in milliseconds since epoch.
    pub created_at_ms: i64,

    /// Optional expiry; a credential past this instant fails authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,

    /// Updated on every successful use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_ms: Option<i64>,

    /// Disabled credentials fail authentication without being deleted.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

// Custom Debug that never prints the secret.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .field("scopes", &self.scopes)
            .field("enabled", &self.enabled)
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

impl Credential {
    /// Whether this credential holds `scope`, directly or via `Admin`.
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&Scope::Admin) || self.scopes.contains(&scope)
    }

    /// Whether this credential holds the `Admin` scope.
    pub fn is_admin(&self) -> bool {
        self.scopes.contains(&Scope::Admin)
    }

    /// Whether this credential is past its expiry at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at_ms, Some(exp) if now_ms > exp)
    }
}

/// A credential listing entry, safe to return to admin callers. Carries
/// the fingerprint instead of the secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub id: String,
    pub name: String,
    pub fingerprint: String,
    pub scopes: BTreeSet<Scope>,
    pub enabled: bool,
    pub created_at_ms: i64,
    pub expires_at_ms: Option<i64>,
    pub last_used_ms: Option<i64>,
}

impl From<&Credential> for CredentialSummary {
    fn from(cred: &Credential) -> Self {
        Self {
            id: cred.id.clone(),
            name: cred.name.clone(),
            fingerprint: fingerprint(&cred.secret),
            scopes: cred.scopes.clone(),
            enabled: cred.enabled,
            created_at_ms: cred.created_at_ms,
            expires_at_ms: cred.expires_at_ms,
            last_used_ms: cred.last_used_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Global rules
// ---------------------------------------------------------------------------

/// Rules applied to every credential, on top of its own lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalRules {
    /// Path prefixes no credential may target.
    #[serde(default)]
    pub path_denylist: Vec<PathBuf>,

    /// If non-empty, every path target must fall under one of these prefixes.
    #[serde(default)]
    pub path_allowlist: Vec<PathBuf>,

    /// Operation classes that always require approval.
    #[serde(default)]
    pub require_approval: BTreeSet<OpClass>,

    /// If true, approval-required operation classes hold even for `Admin`
    /// credentials. Default: admin is exempt.
    #[serde(default)]
    pub approval_binds_admin: bool,
}

// ---------------------------------------------------------------------------
// On-disk format
// ---------------------------------------------------------------------------

/// The credential file: one record per credential plus the global rules.
/// Rewritten atomically on every mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialFile {
    #[serde(default)]
    pub tokens: Vec<Credential>,

    #[serde(default)]
    pub global_rules: GlobalRules,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the credential store. Loading is all-or-nothing: a corrupt
/// backing file is an error, never a partially applied policy.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential store parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown credential id: {0}")]
    UnknownCredential(String),

    #[error("duplicate credential id: {0}")]
    DuplicateId(String),
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// An immutable view of the store at one point in time.
#[derive(Debug)]
pub struct Snapshot {
    pub credentials: Vec<Arc<Credential>>,
    pub global_rules: GlobalRules,
}

impl Snapshot {
    fn from_file(file: CredentialFile) -> Self {
        Self {
            credentials: file.tokens.into_iter().map(Arc::new).collect(),
            global_rules: file.global_rules,
        }
    }

    fn to_file(&self) -> CredentialFile {
        CredentialFile {
            tokens: self
                .credentials
                .iter()
                .map(|c| Credential::clone(c))
                .collect(),
            global_rules: self.global_rules.clone(),
        }
    }

    fn get(&self, id: &str) -> Option<&Arc<Credential>> {
        self.credentials.iter().find(|c| c.id == id)
    }
}

/// The credential store.
///
/// Readers call [`CredentialStore::snapshot`] or [`CredentialStore::resolve`]
/// and never block behind administrative mutations; mutations rebuild the
/// snapshot under the write lock and persist the new file outside it.
#[derive(Debug)]
pub struct CredentialStore {
    path: Option<PathBuf>,
    inner: RwLock<Arc<Snapshot>>,
}

impl CredentialStore {
    /// Load the store from `path`.
    ///
    /// A missing file yields an empty store (the gateway fails closed on an
    /// empty store unless open mode is explicitly enabled). An unreadable or
    /// corrupt file is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            CredentialFile::default()
        };
        Ok(Self {
            path: Some(path),
            inner: RwLock::new(Arc::new(Snapshot::from_file(file))),
        })
    }

    /// Build an in-memory store with no backing file. Used by tests and by
    /// open-mode bootstrap.
    pub fn in_memory(file: CredentialFile) -> Self {
        Self {
            path: None,
            inner: RwLock::new(Arc::new(Snapshot::from_file(file))),
        }
    }

    /// Current snapshot. Cheap: clones one `Arc`.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.read().expect("store lock poisoned").clone()
    }

    /// Number of credentials in the current snapshot.
    pub fn len(&self) -> usize {
        self.snapshot().credentials.len()
    }

    /// Whether the store holds no credentials.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a presented secret to its credential.
    ///
    /// Every stored secret is compared in constant time and the scan never
    /// exits early, so response timing does not reveal which (if any)
    /// credential matched.
    pub fn resolve(&self, secret: &str) -> Option<Arc<Credential>> {
        let snap = self.snapshot();
        let mut found = None;
        for cred in &snap.credentials {
            if secret_eq(&cred.secret, secret) {
                found = Some(cred.clone());
            }
        }
        found
    }

    /// Update a credential's last-used timestamp and persist.
    pub fn touch(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(id, |cred| {
            cred.last_used_ms = Some(now_ms());
            Ok(())
        })?;
        Ok(())
    }

    /// Create a credential with a freshly generated id and secret. Returns
    /// the credential; the secret is only available here and via the returned
    /// record.
    pub fn create(
        &self,
        name: impl Into<String>,
        scopes: BTreeSet<Scope>,
        expires_in_days: Option<u32>,
    ) -> Result<Arc<Credential>, StoreError> {
        let now = now_ms();
        let cred = Credential {
            id: generate_token_id(),
            name: name.into(),
            secret: generate_secret(),
            scopes,
            path_allowlist: None,
            path_denylist: None,
            command_allowlist: None,
            command_denylist: None,
            rate_limits: RateLimitConfig::default(),
            op_limits: HashMap::new(),
            require_approval: BTreeSet::new(),
            created_at_ms: now,
            expires_at_ms: expires_in_days.map(|d| now + i64::from(d) * 86_400_000),
            last_used_ms: None,
            enabled: true,
        };
        self.insert(cred.clone())?;
        Ok(Arc::new(cred))
    }

    /// Insert a fully specified credential. Fails on duplicate id.
    pub fn insert(&self, cred: Credential) -> Result<(), StoreError> {
        let file = {
            let mut guard = self.inner.write().expect("store lock poisoned");
            if guard.get(&cred.id).is_some() {
                return Err(StoreError::DuplicateId(cred.id));
            }
            let mut file = guard.to_file();
            file.tokens.push(cred);
            *guard = Arc::new(Snapshot::from_file(file.clone()));
            file
        };
        self.persist(&file)
    }

    /// Replace the secret of an existing credential. Returns the new secret.
    pub fn rotate(&self, id: &str) -> Result<String, StoreError> {
        let new_secret = random_hex(16);
        let secret = new_secret.clone();
        self.mutate(id, move |cred| {
            cred.secret = secret;
            Ok(())
        })?;
        Ok(new_secret)
    }

    /// Disable a credential without deleting it.
    pub fn disable(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(id, |cred| {
            cred.enabled = false;
            Ok(())
        })
    }

    /// Remove a credential entirely.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let file = {
            let mut guard = self.inner.write().expect("store lock poisoned");
            if guard.get(id).is_none() {
                return Err(StoreError::UnknownCredential(id.to_owned()));
            }
            let mut file = guard.to_file();
            file.tokens.retain(|c| c.id != id);
            *guard = Arc::new(Snapshot::from_file(file.clone()));
            file
        };
        self.persist(&file)
    }

    /// List credentials without secret values.
    pub fn list(&self) -> Vec<CredentialSummary> {
        self.snapshot()
            .credentials
            .iter()
            .map(|c| CredentialSummary::from(c.as_ref()))
            .collect()
    }

    /// Apply `f` to the credential `id`, swap in the new snapshot, persist.
    fn mutate(
        &self,
        id: &str,
        f: impl FnOnce(&mut Credential) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let file = {
            let mut guard = self.inner.write().expect("store lock poisoned");
            if guard.get(id).is_none() {
                return Err(StoreError::UnknownCredential(id.to_owned()));
            }
            let mut file = guard.to_file();
            for cred in &mut file.tokens {
                if cred.id == id {
                    f(cred)?;
                    break;
                }
            }
            *guard = Arc::new(Snapshot::from_file(file.clone()));
            file
        };
        self.persist(&file)
    }

    /// Write the credential file atomically: temp file, fsync, rename over
    /// the target, prior version retained at `<path>.bak`.
    fn persist(&self, file: &CredentialFile) -> Result<(), StoreError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            let backup = backup_path(path);
            std::fs::copy(path, &backup)?;
        }

        let tmp = tmp_path(path);
        let bytes = serde_json::to_vec_pretty(file)?;
        {
            use std::io::Write;
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".tmp");
    PathBuf::from(p)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".bak");
    PathBuf::from(p)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Constant-time secret equality. Differing lengths compare unequal without
/// inspecting content.
fn secret_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// One-way, truncated identifier for a secret: first 12 hex chars of its
/// SHA-256. Safe for logs and audit records.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let mut hexed = hex::encode(digest);
    hexed.truncate(12);
    hexed
}

/// Generate a fresh credential secret (32 hex chars).
pub fn generate_secret() -> String {
    random_hex(16)
}

/// Generate a fresh credential id.
pub fn generate_token_id() -> String {
    format!("tok_{}", random_hex(8))
}

/// Generate `n` random bytes as lowercase hex.
fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
