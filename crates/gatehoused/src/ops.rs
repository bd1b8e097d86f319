//! Operation handlers: the filesystem and process work performed after a
//! request clears the authorization pipeline.
//!
//! Handlers never consult policy. By the time a request lands here it has
//! been authenticated, rate-limited, evaluated, and (where required)
//! approved; the only job left is doing the work with bounded output.

use std::path::Path;
use std::time::{Duration, Instant};

use gatehouse_core::proto::{DirEntry, OpRequest, OpResult};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Cap on file contents returned from `fs_read`.
pub const MAX_READ_BYTES: u64 = 1024 * 1024;

/// Cap on captured bytes per exec output stream.
pub const MAX_EXEC_OUTPUT_BYTES: usize = 1024 * 1024;

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    InvalidRequest(String),
}

/// Execute one operation request.
pub async fn perform(request: &OpRequest) -> Result<OpResult, OpError> {
    match request {
        OpRequest::FsList { path } => fs_list(path).await,
        OpRequest::FsRead { path } => fs_read(path).await,
        OpRequest::FsWrite { path, contents } => fs_write(path, contents).await,
        OpRequest::FsMkdir { path } => fs_mkdir(path).await,
        OpRequest::FsDelete { path, recursive } => fs_delete(path, *recursive).await,
        OpRequest::Exec {
            argv,
            cwd,
            timeout_ms,
        } => exec(argv, cwd.as_deref(), *timeout_ms).await,
    }
}

async fn fs_list(path: &Path) -> Result<OpResult, OpError> {
    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let meta = entry.metadata().await?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: meta.len(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(OpResult::FsList { entries })
}

async fn fs_read(path: &Path) -> Result<OpResult, OpError> {
    let file = tokio::fs::File::open(path).await?;
    let meta = file.metadata().await?;
    let truncated = meta.len() > MAX_READ_BYTES;

    let mut buf = Vec::with_capacity(meta.len().min(MAX_READ_BYTES) as usize);
    file.take(MAX_READ_BYTES).read_to_end(&mut buf).await?;

    let contents = String::from_utf8(buf)
        .map_err(|_| OpError::InvalidRequest("file is not valid UTF-8".into()))?;
    Ok(OpResult::FsRead {
        contents,
        truncated,
    })
}

async fn fs_write(path: &Path, contents: &str) -> Result<OpResult, OpError> {
    tokio::fs::write(path, contents.as_bytes()).await?;
    Ok(OpResult::FsWrite {
        bytes_written: contents.len() as u64,
    })
}

async fn fs_mkdir(path: &Path) -> Result<OpResult, OpError> {
    tokio::fs::create_dir_all(path).await?;
    Ok(OpResult::FsMkdir {})
}

async fn fs_delete(path: &Path, recursive: bool) -> Result<OpResult, OpError> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        if recursive {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_dir(path).await?;
        }
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(OpResult::FsDelete {})
}

async fn exec(
    argv: &[String],
    cwd: Option<&Path>,
    timeout_ms: Option<u64>,
) -> Result<OpResult, OpError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(OpError::InvalidRequest("empty argv".into()));
    };

    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_EXEC_TIMEOUT)
        .min(MAX_EXEC_TIMEOUT);

    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let started = Instant::now();
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| OpError::Timeout(timeout))??;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (stdout, out_truncated) = bounded_utf8(&output.stdout);
    let (stderr, err_truncated) = bounded_utf8(&output.stderr);

    Ok(OpResult::Exec {
        // Signal-terminated children report -1.
        exit_code: output.status.code().unwrap_or(-1),
        stdout,
        stderr,
        truncated: out_truncated || err_truncated,
        duration_ms,
    })
}

/// Lossy-decode captured output, cut off at the stream cap on a char
/// boundary.
fn bounded_utf8(bytes: &[u8]) -> (String, bool) {
    let truncated = bytes.len() > MAX_EXEC_OUTPUT_BYTES;
    let slice = if truncated {
        &bytes[..MAX_EXEC_OUTPUT_BYTES]
    } else {
        bytes
    };
    let mut text = String::from_utf8_lossy(slice).into_owned();
    if truncated {
        // A split multibyte char decodes to U+FFFD at the end; drop it.
        while text.ends_with('\u{FFFD}') {
            text.pop();
        }
    }
    (text, truncated)
}
