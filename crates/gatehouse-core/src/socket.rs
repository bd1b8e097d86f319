//! Socket path resolution for the daemon and its clients.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const DEFAULT_SOCKET_FILENAME: &str = "gatehoused.sock";

/// Resolve the socket path, optionally allowing the `GATEHOUSE_SOCK` env
/// override.
///
/// The daemon calls `socket_path_for_client(false)` to ignore the env var
/// (prevents an attacker from redirecting via environment). Clients use
/// `socket_path()` which delegates to `socket_path_for_client(true)`.
pub fn socket_path_for_client(allow_env_override: bool) -> PathBuf {
    if allow_env_override {
        if let Ok(p) = std::env::var("GATEHOUSE_SOCK") {
            return PathBuf::from(p);
        }
    }

    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        let dir_path = Path::new(&dir);
        // Reject non-absolute or paths with `..` components.
        if dir_path.is_absolute()
            && !dir_path
                .components()
                .any(|c| c == std::path::Component::ParentDir)
        {
            return dir_path.join("gatehouse").join(DEFAULT_SOCKET_FILENAME);
        }
    }

    let home = std::env::var_os("HOME").unwrap_or_else(|| OsString::from("."));
    PathBuf::from(home)
        .join(".gatehouse")
        .join("run")
        .join(DEFAULT_SOCKET_FILENAME)
}

/// Resolve the socket path (client-side, allows env override).
pub fn socket_path() -> PathBuf {
    socket_path_for_client(true)
}

/// Create the socket's parent directory, user-only on unix.
pub fn ensure_socket_parent_dir(path: &Path) -> std::io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };

    std::fs::create_dir_all(parent)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

/// Walk each component of a path and verify none are symlinks.
///
/// This prevents TOCTOU symlink attacks on the socket path chain. Components
/// that do not exist yet (the socket file before bind) are acceptable.
#[cfg(unix)]
pub fn validate_path_chain(path: &Path) -> std::io::Result<()> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if current.as_os_str() == "/" {
            continue;
        }
        match current.symlink_metadata() {
            Ok(meta) => {
                if meta.file_type().is_symlink() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        format!("path component is a symlink: {}", current.display()),
                    ));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
