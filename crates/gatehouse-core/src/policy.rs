//! Permission evaluator: scoped, allowlist/denylist authorization for
//! operation requests.
//!
//! The evaluator answers one question: may this credential perform this
//! operation class on this target? The answer is [`Access::Allow`],
//! [`Access::Deny`] with a category-only reason, or
//! [`Access::RequiresApproval`].
//!
//! The denylist dominates the allowlist at every step, and path targets are
//! compared in normalized, symlink-resolved absolute form; traversal via
//! `..` or symlink indirection must never reach a comparison in raw form.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::credential::{Credential, GlobalRules, OpClass, Scope};

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// The resolved target of an operation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    /// An absolute filesystem path.
    Path { path: PathBuf },

    /// A full argument vector; `argv[0]` is the program.
    Command { argv: Vec<String> },
}

impl Target {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path { path: path.into() }
    }

    pub fn command<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Command {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    /// Compact display form for audit records. Paths render as-is; commands
    /// as the joined argv.
    pub fn summary(&self) -> String {
        match self {
            Self::Path { path } => path.display().to_string(),
            Self::Command { argv } => argv.join(" "),
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Why a request was denied. Reasons are category-only: they never echo the
/// denylist entry that matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    MissingScope { scope: Scope },
    PathDenied,
    PathNotAllowlisted,
    PathEscapesBase,
    CommandDenied,
    CommandNotAllowlisted,
    InvalidTarget,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingScope { scope } => write!(f, "missing scope '{scope}'"),
            Self::PathDenied => write!(f, "path denied"),
            Self::PathNotAllowlisted => write!(f, "path not allowlisted"),
            Self::PathEscapesBase => write!(f, "path escapes base directory"),
            Self::CommandDenied => write!(f, "command denied"),
            Self::CommandNotAllowlisted => write!(f, "command not allowlisted"),
            Self::InvalidTarget => write!(f, "invalid target"),
        }
    }
}

/// The result of evaluating a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny(DenyReason),
    RequiresApproval,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Deny(reason) => write!(f, "DENY: {reason}"),
            Self::RequiresApproval => write!(f, "REQUIRES_APPROVAL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Evaluate whether `cred` may perform `op_class` on `target`.
///
/// Order: admin short-circuit, scope check, path/command list checks
/// (denylist first, then allowlist), approval flag. `base_dir`, when set,
/// bounds every path target after normalization.
pub fn evaluate(
    cred: &Credential,
    rules: &GlobalRules,
    op_class: OpClass,
    target: &Target,
    base_dir: Option<&Path>,
) -> Access {
    // Admin bypasses list and scope checks but not rate limiting or auditing
    // (those live outside the evaluator). Approval can be made to bind admin
    // via global_rules.
    if cred.is_admin() {
        if rules.approval_binds_admin && requires_approval(cred, rules, op_class) {
            return Access::RequiresApproval;
        }
        return Access::Allow;
    }

    let required = op_class.required_scope();
    if !cred.has_scope(required) {
        return Access::Deny(DenyReason::MissingScope { scope: required });
    }

    match target {
        Target::Path { path } => {
            let normalized = match normalize_path(path) {
                Ok(p) => p,
                Err(reason) => return Access::Deny(reason),
            };

            if let Some(base) = base_dir {
                let base = match normalize_path(base) {
                    Ok(b) => b,
                    Err(reason) => return Access::Deny(reason),
                };
                if !normalized.starts_with(&base) {
                    return Access::Deny(DenyReason::PathEscapesBase);
                }
            }

            // Denylist first: global, then credential. Denylist always wins.
            if prefix_match(&normalized, &rules.path_denylist) {
                return Access::Deny(DenyReason::PathDenied);
            }
            if let Some(ref denied) = cred.path_denylist {
                if prefix_match(&normalized, denied) {
                    return Access::Deny(DenyReason::PathDenied);
                }
            }

            // Allowlist mode: if any allowlist exists (global or credential),
            // the path must fall under one of the allowed prefixes.
            let cred_allow = cred.path_allowlist.as_deref().unwrap_or(&[]);
            if !rules.path_allowlist.is_empty() || cred.path_allowlist.is_some() {
                let allowed = prefix_match(&normalized, &rules.path_allowlist)
                    || prefix_match(&normalized, cred_allow);
                if !allowed {
                    return Access::Deny(DenyReason::PathNotAllowlisted);
                }
            }
        }
        Target::Command { argv } => {
            let Some(program) = argv.first() else {
                return Access::Deny(DenyReason::InvalidTarget);
            };

            // sudo escalates the required scope.
            if op_class == OpClass::Exec
                && argv.iter().any(|a| a == "sudo")
                && !cred.has_scope(Scope::ExecPrivileged)
            {
                return Access::Deny(DenyReason::MissingScope {
                    scope: Scope::ExecPrivileged,
                });
            }

            let name = program_name(program);
            let joined = argv.join(" ");

            if let Some(ref denied) = cred.command_denylist {
                for entry in denied {
                    if name == entry.as_str() || joined.starts_with(entry.as_str()) {
                        return Access::Deny(DenyReason::CommandDenied);
                    }
                }
            }

            if let Some(ref allowed) = cred.command_allowlist {
                if !allowed.iter().any(|entry| name == entry.as_str()) {
                    return Access::Deny(DenyReason::CommandNotAllowlisted);
                }
            }
        }
    }

    if requires_approval(cred, rules, op_class) {
        return Access::RequiresApproval;
    }

    Access::Allow
}

fn requires_approval(cred: &Credential, rules: &GlobalRules, op_class: OpClass) -> bool {
    cred.require_approval.contains(&op_class) || rules.require_approval.contains(&op_class)
}

fn prefix_match(path: &Path, prefixes: &[PathBuf]) -> bool {
    prefixes.iter().any(|p| path.starts_with(p))
}

/// Strip the directory component of a program invocation: `/usr/bin/git`
/// and `git` both compare as `git`.
fn program_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
}

// ---------------------------------------------------------------------------
// Path normalization
// ---------------------------------------------------------------------------

/// Normalize a path for policy comparison.
///
/// The deepest existing ancestor is canonicalized (collapsing symlinks and
/// `.`/`..`); the remaining, not-yet-existing components are appended
/// literally. Any `..` in the non-existing tail is rejected outright: it
/// cannot be resolved safely, so it never reaches a prefix comparison.
///
/// Existence is probed with `symlink_metadata` so that a dangling symlink
/// counts as existing: it must reach `canonicalize` (which rejects it)
/// rather than slip into the lexical tail with its link target unresolved.
///
/// Relative paths are rejected: callers submit resolved absolute targets.
pub fn normalize_path(path: &Path) -> Result<PathBuf, DenyReason> {
    if !path.is_absolute() {
        return Err(DenyReason::InvalidTarget);
    }

    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();

    while existing.symlink_metadata().is_err() {
        // Reject `..`/`.` in the non-existing tail. `file_name()` returns
        // None when the final component is `..`.
        let has_dots = matches!(
            existing.components().next_back(),
            Some(Component::ParentDir) | Some(Component::CurDir)
        );
        let Some(name) = existing.file_name() else {
            return Err(DenyReason::InvalidTarget);
        };
        if has_dots {
            return Err(DenyReason::InvalidTarget);
        }
        tail.push(name.to_owned());
        let Some(parent) = existing.parent() else {
            return Err(DenyReason::InvalidTarget);
        };
        existing = parent.to_path_buf();
    }

    let mut normalized = existing
        .canonicalize()
        .map_err(|_| DenyReason::InvalidTarget)?;
    for name in tail.into_iter().rev() {
        normalized.push(name);
    }
    Ok(normalized)
}
