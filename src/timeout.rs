//! Timeout policy shared by the sandboxed worker and the host.
//!
//! ```text
//! timeout(size, pages?) = max(per_mb × size_in_MiB, min, pages? × per_page)
//! ```
//!
//! ## Why one formula on both sides?
//!
//! The worker uses it to bound each external tool (office suite, rasterizer,
//! OCR engine); the host uses the same numbers, plus a grace period, to bound
//! the whole sandboxed phase. Because the host's bound is always at least the
//! worker's, a well-behaved worker reports its own timeout through its exit
//! status before the host ever has to kill it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIB: f64 = 1024.0 * 1024.0;

/// Longest timeout ever returned: one week.
pub const MAX_TIMEOUT_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// Environment variable that disables all timeouts when set to `0`.
pub const ENABLE_TIMEOUTS_ENV: &str = "ENABLE_TIMEOUTS";

/// Maps payload size and page count to an operation timeout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Seconds allowed per MiB of input. Default: 30.
    pub per_mb_secs: f64,
    /// Lower bound in seconds. Default: 60.
    pub min_secs: f64,
    /// Seconds allowed per page, once the page count is known. Default: 30.
    pub per_page_secs: f64,
    /// When false every call returns `None`. Default: true.
    pub enabled: bool,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            per_mb_secs: 30.0,
            min_secs: 60.0,
            per_page_secs: 30.0,
            enabled: true,
        }
    }
}

impl TimeoutPolicy {
    /// A policy with timeouts turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Default policy, disabled when `ENABLE_TIMEOUTS=0` is set.
    pub fn from_env() -> Self {
        match std::env::var(ENABLE_TIMEOUTS_ENV) {
            Ok(v) if v.trim() == "0" => Self::disabled(),
            _ => Self::default(),
        }
    }

    /// Timeout for an operation over `size_bytes` of input and, if known,
    /// `pages` pages.
    ///
    /// Returns `None` when timeouts are disabled; never returns zero.
    pub fn timeout(&self, size_bytes: u64, pages: Option<u32>) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        let size_mib = size_bytes as f64 / MIB;
        let mut secs = (self.per_mb_secs * size_mib).max(self.min_secs);
        if let Some(pages) = pages {
            secs = secs.max(self.per_page_secs * f64::from(pages));
        }
        // Guard against a zero, negative or NaN configuration.
        let secs = if secs > 0.0 { secs.min(MAX_TIMEOUT_SECS) } else { 1.0 };
        Some(Duration::from_secs_f64(secs))
    }
}
