//! Sliding-window rate limiting, keyed per credential.
//!
//! Three fixed windows (minute, hour, day) apply in parallel; a request is
//! admitted only if every configured limit has headroom. Per-operation-class
//! limits stack on top of the credential-wide ones. Admission and recording
//! happen in one step so two concurrent requests cannot both squeeze through
//! the last slot.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::credential::{OpClass, RateLimitConfig};

const SHARD_COUNT: usize = 16;

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    pub fn duration_ms(self) -> i64 {
        match self {
            Self::Minute => 60 * 1000,
            Self::Hour => 3600 * 1000,
            Self::Day => 86_400 * 1000,
        }
    }

    fn limit(self, config: &RateLimitConfig) -> Option<u32> {
        match self {
            Self::Minute => config.per_minute,
            Self::Hour => config.per_hour,
            Self::Day => config.per_day,
        }
    }

    const ALL: [Window; 3] = [Window::Minute, Window::Hour, Window::Day];
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minute => write!(f, "minute"),
            Self::Hour => write!(f, "hour"),
            Self::Day => write!(f, "day"),
        }
    }
}

/// A request was rejected by the limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimited {
    /// The window whose limit was hit. When several windows are exhausted at
    /// once this is the one demanding the longest wait.
    pub window: Window,
    /// The configured limit for that window.
    pub limit: u32,
    /// Milliseconds until a slot frees up in that window.
    pub retry_after_ms: i64,
    /// Whether an operation-class limit (rather than the credential-wide
    /// one) was the binding constraint.
    pub op_class: Option<OpClass>,
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rate limit exceeded ({} per {}), retry in {}ms",
            self.limit, self.window, self.retry_after_ms
        )
    }
}

// ---------------------------------------------------------------------------
// Limiter
// ---------------------------------------------------------------------------

/// Timestamps for one credential. The day window bounds retention, so a
/// single deque per bucket serves all three windows.
#[derive(Debug, Default)]
struct Usage {
    all: VecDeque<i64>,
    per_op: HashMap<OpClass, VecDeque<i64>>,
}

/// Sharded sliding-window limiter. Each shard owns a disjoint set of
/// credential ids, so contention stays local under concurrent load.
#[derive(Debug)]
pub struct RateLimiter {
    shards: Vec<Mutex<HashMap<String, Usage>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    /// Admit or reject a request at `now_ms`. On admit, the request is
    /// recorded against both the credential-wide and the per-class buckets.
    pub fn check(
        &self,
        credential_id: &str,
        op_class: OpClass,
        limits: &RateLimitConfig,
        op_limits: &HashMap<OpClass, RateLimitConfig>,
        now_ms: i64,
    ) -> Result<(), RateLimited> {
        let op_config = op_limits.get(&op_class);
        if limits.is_unlimited() && op_config.map_or(true, RateLimitConfig::is_unlimited) {
            return Ok(());
        }

        let shard = &self.shards[shard_index(credential_id)];
        let mut map = shard.lock().expect("rate limiter shard lock poisoned");
        let usage = map.entry(credential_id.to_string()).or_default();

        let cutoff = now_ms - Window::Day.duration_ms();
        prune(&mut usage.all, cutoff);

        let mut worst: Option<RateLimited> = None;
        if let Some(hit) = tightest(&usage.all, limits, None, now_ms) {
            worst = Some(hit);
        }
        if let Some(config) = op_config {
            if let Some(bucket) = usage.per_op.get_mut(&op_class) {
                prune(bucket, cutoff);
            }
            let bucket = usage.per_op.entry(op_class).or_default();
            if let Some(hit) = tightest(bucket, config, Some(op_class), now_ms) {
                if worst
                    .as_ref()
                    .map_or(true, |w| hit.retry_after_ms > w.retry_after_ms)
                {
                    worst = Some(hit);
                }
            }
        }
        if let Some(hit) = worst {
            return Err(hit);
        }

        usage.all.push_back(now_ms);
        if op_config.is_some() {
            usage.per_op.entry(op_class).or_default().push_back(now_ms);
        }
        Ok(())
    }

    /// Drop all recorded usage for a credential. Called when a credential is
    /// removed or rotated so the new secret starts with a clean slate.
    pub fn forget(&self, credential_id: &str) {
        let shard = &self.shards[shard_index(credential_id)];
        let mut map = shard.lock().expect("rate limiter shard lock poisoned");
        map.remove(credential_id);
    }
}

fn shard_index(credential_id: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    credential_id.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

fn prune(bucket: &mut VecDeque<i64>, cutoff: i64) {
    while bucket.front().is_some_and(|&t| t <= cutoff) {
        bucket.pop_front();
    }
}

/// Find the exceeded window demanding the longest wait, if any. Timestamps
/// in `bucket` are already pruned to the day window and sorted ascending.
fn tightest(
    bucket: &VecDeque<i64>,
    config: &RateLimitConfig,
    op_class: Option<OpClass>,
    now_ms: i64,
) -> Option<RateLimited> {
    let mut worst: Option<RateLimited> = None;
    for window in Window::ALL {
        let Some(limit) = window.limit(config) else {
            continue;
        };
        // A zero cap means the window is unlimited, not closed.
        if limit == 0 {
            continue;
        }
        let start = now_ms - window.duration_ms();
        let in_window = bucket.iter().rev().take_while(|&&t| t > start).count();
        if in_window < limit as usize {
            continue;
        }
        // The slot frees when the oldest in-window timestamp ages out.
        let oldest = bucket
            .iter()
            .rev()
            .take(in_window)
            .last()
            .copied()
            .unwrap_or(now_ms);
        let retry_after_ms = (oldest + window.duration_ms() - now_ms).max(1);
        let hit = RateLimited {
            window,
            limit,
            retry_after_ms,
            op_class,
        };
        if worst
            .as_ref()
            .map_or(true, |w| hit.retry_after_ms > w.retry_after_ms)
        {
            worst = Some(hit);
        }
    }
    worst
}
