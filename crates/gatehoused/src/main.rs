use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use gatehouse_core::audit::{AuditSink, JsonlAuditSink, TracingAuditSink};
use gatehouse_core::credential::CredentialStore;
use gatehouse_core::proto::{
    method, ApprovalDecideParams, AuthedParams, ExecuteParams, Request, Response, TokenCreateParams,
    TokenIdParams, VersionResult,
};
use gatehouse_core::socket::{ensure_socket_parent_dir, socket_path_for_client};
use gatehouse_core::{API_VERSION, MAX_FRAME_LENGTH};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{info, warn};

mod gateway;
mod ops;

use gateway::{Gateway, GatewayConfig, GatewayError};

/// Scoped filesystem and process access for untrusted agents, served over a
/// local Unix socket.
#[derive(Debug, Parser)]
#[command(name = "gatehoused", version)]
struct Cli {
    /// Credential file. Defaults to `~/.gatehouse/tokens.json`.
    #[arg(long)]
    tokens: Option<PathBuf>,

    /// Append-only JSONL audit log. Defaults to `~/.gatehouse/audit.jsonl`.
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Skip the persistent audit log; events go to tracing output only.
    #[arg(long)]
    no_audit_log: bool,

    /// Socket path. Defaults to the runtime dir; `GATEHOUSE_SOCK` is
    /// deliberately ignored by the daemon.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Confine every path operation to this directory.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Serve requests without credentials while the token store is empty.
    /// Intended for first-run bootstrap only; every admitted request is
    /// audited under a reserved fingerprint.
    #[arg(long)]
    open_mode: bool,

    /// Seconds an approval ticket waits for a decision before expiring.
    #[arg(long, default_value_t = 30)]
    approval_timeout_secs: u64,

    /// Cut path targets in audit records to this many leading components.
    #[arg(long)]
    audit_redact_depth: Option<usize>,
}

struct DaemonState {
    gateway: Gateway,
    version: &'static str,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("gatehoused: {e}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn state_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    PathBuf::from(home).join(".gatehouse")
}

async fn run(cli: Cli) -> std::io::Result<()> {
    let tokens_path = cli.tokens.unwrap_or_else(|| state_dir().join("tokens.json"));
    let store = CredentialStore::load(&tokens_path).map_err(std::io::Error::other)?;
    if store.is_empty() && !cli.open_mode {
        warn!(
            "token store {} is empty; all requests will be refused (start with --open-mode to bootstrap)",
            tokens_path.display()
        );
    }

    let audit: Arc<dyn AuditSink> = if cli.no_audit_log {
        Arc::new(TracingAuditSink::new())
    } else {
        let audit_path = cli
            .audit_log
            .unwrap_or_else(|| state_dir().join("audit.jsonl"));
        info!("audit log at {}", audit_path.display());
        Arc::new(JsonlAuditSink::new(audit_path).map_err(std::io::Error::other)?)
    };

    let gateway = Gateway::new(
        store,
        audit,
        GatewayConfig {
            base_dir: cli.base_dir,
            open_mode: cli.open_mode,
            approval_timeout: Duration::from_secs(cli.approval_timeout_secs),
            redact_depth: cli.audit_redact_depth,
        },
    );

    let socket = cli.socket.unwrap_or_else(|| socket_path_for_client(false));
    serve(gateway, socket).await
}

async fn serve(gateway: Gateway, socket: PathBuf) -> std::io::Result<()> {
    ensure_socket_parent_dir(&socket)?;

    #[cfg(unix)]
    gatehouse_core::socket::validate_path_chain(&socket)?;

    if socket.exists() {
        match UnixStream::connect(&socket).await {
            Ok(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("socket already in use: {}", socket.display()),
                ));
            }
            Err(_) => {
                // Stale socket file.
                tokio::fs::remove_file(&socket).await?;
            }
        }
    }

    let listener = UnixListener::bind(&socket)?;
    lock_down_socket_path(&socket)?;
    let _socket_guard = SocketGuard::new(socket.clone());

    info!("listening on {}", socket.display());

    let state = Arc::new(DaemonState {
        gateway,
        version: env!("CARGO_PKG_VERSION"),
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested (ctrl-c)");
                break;
            }
            _ = sigterm.recv() => {
                info!("shutdown requested (sigterm)");
                break;
            }
            res = listener.accept() => {
                let (stream, _addr) = res?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_conn(state, stream).await {
                        warn!("connection error: {e}");
                    }
                });
            }
        }
    }

    Ok(())
}

fn lock_down_socket_path(path: &std::path::Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Only the owning user may connect.
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_conn(state: Arc<DaemonState>, stream: UnixStream) -> std::io::Result<()> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    let mut framed = Framed::new(stream, codec);

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(b) => b,
            Err(e) => {
                let resp = Response::err(None, "bad_frame", e.to_string());
                let bytes = serde_json::to_vec(&resp)
                    .unwrap_or_else(|_| b"{\"error\":\"encode\"}".to_vec());
                let _ = framed.send(Bytes::from(bytes)).await;
                return Err(e);
            }
        };

        let req: Request = match serde_json::from_slice(&frame) {
            Ok(r) => r,
            Err(e) => {
                let resp = Response::err(None, "bad_json", e.to_string());
                let bytes = serde_json::to_vec(&resp)
                    .unwrap_or_else(|_| b"{\"error\":\"encode\"}".to_vec());
                let _ = framed.send(Bytes::from(bytes)).await;
                continue;
            }
        };

        // Never log params; they carry bearer secrets.
        let resp = handle_request(&state, req).await;
        let out = serde_json::to_vec(&resp).map_err(std::io::Error::other)?;
        framed.send(Bytes::from(out)).await?;
    }

    Ok(())
}

async fn handle_request(state: &DaemonState, req: Request) -> Response {
    let id = req.id;
    match req.method.as_str() {
        method::PING => Response::ok(id, serde_json::json!({ "ok": true })),
        method::VERSION => to_ok(
            id,
            &VersionResult {
                version: state.version.to_string(),
                api_version: API_VERSION,
            },
        ),
        method::EXECUTE => {
            let params: ExecuteParams = match parse_params(id, req.params) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            match state
                .gateway
                .execute(params.secret.as_str(), params.request)
                .await
            {
                Ok(result) => to_ok(id, &result),
                Err(e) => to_err(id, &e),
            }
        }
        method::APPROVAL_LIST => {
            let params: AuthedParams = match parse_params(id, req.params) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            match state.gateway.list_approvals(params.secret.as_str()) {
                Ok(tickets) => Response::ok(id, serde_json::json!({ "tickets": tickets })),
                Err(e) => to_err(id, &e),
            }
        }
        method::APPROVAL_DECIDE => {
            let params: ApprovalDecideParams = match parse_params(id, req.params) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            match state
                .gateway
                .decide_approval(params.secret.as_str(), params.id, params.approve)
            {
                Ok(decided) => Response::ok(id, serde_json::json!({ "state": decided })),
                Err(e) => to_err(id, &e),
            }
        }
        method::TOKEN_LIST => {
            let params: AuthedParams = match parse_params(id, req.params) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            match state.gateway.list_tokens(params.secret.as_str()) {
                Ok(tokens) => Response::ok(id, serde_json::json!({ "tokens": tokens })),
                Err(e) => to_err(id, &e),
            }
        }
        method::TOKEN_CREATE => {
            let params: TokenCreateParams = match parse_params(id, req.params) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            match state.gateway.create_token(params) {
                Ok(result) => to_ok(id, &result),
                Err(e) => to_err(id, &e),
            }
        }
        method::TOKEN_ROTATE => {
            let params: TokenIdParams = match parse_params(id, req.params) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            match state.gateway.rotate_token(params.secret.as_str(), &params.id) {
                Ok(result) => to_ok(id, &result),
                Err(e) => to_err(id, &e),
            }
        }
        method::TOKEN_DISABLE => {
            let params: TokenIdParams = match parse_params(id, req.params) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            match state.gateway.disable_token(params.secret.as_str(), &params.id) {
                Ok(()) => Response::ok(id, serde_json::json!({ "disabled": params.id })),
                Err(e) => to_err(id, &e),
            }
        }
        _ => Response::err(Some(id), "unknown_method", "unknown method"),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    id: u64,
    params: serde_json::Value,
) -> Result<T, Response> {
    serde_json::from_value(params)
        .map_err(|e| Response::err(Some(id), "bad_request", format!("invalid params: {e}")))
}

fn to_ok<T: serde::Serialize>(id: u64, result: &T) -> Response {
    match serde_json::to_value(result) {
        Ok(v) => Response::ok(id, v),
        Err(e) => Response::err(Some(id), "internal", format!("encode failed: {e}")),
    }
}

fn to_err(id: u64, err: &GatewayError) -> Response {
    Response::err(Some(id), err.code(), err.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use gatehouse_core::audit::InMemoryAuditSink;
    use gatehouse_core::credential::{
        now_ms, Credential, CredentialFile, GlobalRules, RateLimitConfig, Scope,
    };

    use super::*;

    const SECRET: &str = "agent-secret-0123456789abcdef";

    fn test_state(base: &std::path::Path) -> DaemonState {
        let file = CredentialFile {
            tokens: vec![Credential {
                id: "tok_agent".into(),
                name: "agent".into(),
                secret: SECRET.into(),
                scopes: BTreeSet::from([Scope::Read, Scope::Write, Scope::Admin]),
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
            }],
            global_rules: GlobalRules::default(),
        };
        DaemonState {
            gateway: Gateway::new(
                CredentialStore::in_memory(file),
                Arc::new(InMemoryAuditSink::new()),
                GatewayConfig {
                    base_dir: Some(base.to_path_buf()),
                    open_mode: false,
                    approval_timeout: Duration::from_secs(5),
                    redact_depth: None,
                },
            ),
            version: "test",
        }
    }

    fn request(method: &str, params: serde_json::Value) -> Request {
        Request {
            id: 1,
            method: method.into(),
            params,
        }
    }

    #[tokio::test]
    async fn ping_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let resp = handle_request(&state, request(method::PING, serde_json::json!({}))).await;
        assert_eq!(resp.result.unwrap()["ok"], true);

        let resp = handle_request(&state, request(method::VERSION, serde_json::json!({}))).await;
        let result = resp.result.unwrap();
        assert_eq!(result["version"], "test");
        assert_eq!(result["api_version"], API_VERSION);
    }

    #[tokio::test]
    async fn execute_reads_file_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, "over the wire").unwrap();

        let resp = handle_request(
            &state,
            request(
                method::EXECUTE,
                serde_json::json!({
                    "secret": SECRET,
                    "op": "fs_read",
                    "path": path,
                }),
            ),
        )
        .await;
        assert!(resp.error.is_none(), "unexpected error: {:?}", resp.error);
        let result = resp.result.unwrap();
        assert_eq!(result["op"], "fs_read");
        assert_eq!(result["contents"], "over the wire");
    }

    #[tokio::test]
    async fn execute_maps_gateway_errors_to_codes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let resp = handle_request(
            &state,
            request(
                method::EXECUTE,
                serde_json::json!({
                    "secret": "wrong",
                    "op": "fs_list",
                    "path": dir.path(),
                }),
            ),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, "unauthenticated");
    }

    #[tokio::test]
    async fn malformed_params_are_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let resp = handle_request(
            &state,
            request(method::EXECUTE, serde_json::json!({ "op": "fs_read" })),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, "bad_request");
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let resp = handle_request(&state, request("nope", serde_json::json!({}))).await;
        assert_eq!(resp.error.unwrap().code, "unknown_method");
    }

    #[tokio::test]
    async fn token_lifecycle_over_the_api() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let resp = handle_request(
            &state,
            request(
                method::TOKEN_CREATE,
                serde_json::json!({
                    "secret": SECRET,
                    "name": "ci agent",
                    "scopes": ["read"],
                }),
            ),
        )
        .await;
        let created = resp.result.unwrap();
        let new_id = created["token"]["id"].as_str().unwrap().to_string();
        let new_secret = created["secret"].as_str().unwrap().to_string();
        assert!(new_id.starts_with("tok_"));
        assert_eq!(new_secret.len(), 32);
        // Listing shows fingerprints, never secrets.
        let resp = handle_request(
            &state,
            request(method::TOKEN_LIST, serde_json::json!({ "secret": SECRET })),
        )
        .await;
        let listed = serde_json::to_string(&resp.result.unwrap()).unwrap();
        assert!(!listed.contains(&new_secret));

        let resp = handle_request(
            &state,
            request(
                method::TOKEN_ROTATE,
                serde_json::json!({ "secret": SECRET, "id": new_id }),
            ),
        )
        .await;
        let rotated = resp.result.unwrap();
        assert_ne!(rotated["secret"].as_str().unwrap(), new_secret);

        let resp = handle_request(
            &state,
            request(
                method::TOKEN_DISABLE,
                serde_json::json!({ "secret": SECRET, "id": new_id }),
            ),
        )
        .await;
        assert_eq!(resp.result.unwrap()["disabled"], new_id);
    }

    #[tokio::test]
    async fn approval_list_requires_admin() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let resp = handle_request(
            &state,
            request(
                method::APPROVAL_LIST,
                serde_json::json!({ "secret": "wrong" }),
            ),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, "unauthenticated");

        let resp = handle_request(
            &state,
            request(
                method::APPROVAL_LIST,
                serde_json::json!({ "secret": SECRET }),
            ),
        )
        .await;
        assert!(resp.result.unwrap()["tickets"].as_array().unwrap().is_empty());
    }
}
