//! 📦 **Common Backend Configs**: the shared DNA of source and sink configuration.
//!
//! 🧠 Knowledge graph:
//! - `CommonSourceConfig`: flattened into every source backend config. How many groups per
//!   page, and how long we wait for a page before calling it a fatal error.
//! - `CommonSinkConfig`: flattened into every sink backend config. When a batch is "full"
//!   (by count or by age), and whether bulk bodies get gzipped on the way out.
//!
//! ⚠️ These live in `backends` (not `app_config`) to avoid a circular import:
//!   `app_config` → `backends/elasticsearch` → `app_config`. The module system has opinions.

use std::time::Duration;

use serde::Deserialize;

// ============================================================
// 📦 CommonSourceConfig: shared source-side knobs
// ============================================================

/// 📦 Shared configuration embedded by every source backend config.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CommonSourceConfig {
    /// 📏 Groups requested per page. An upper bound; the engine may send fewer.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// ⏱️ Per-request timeout. A timeout is a failed page, never an empty one.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

// 📏 2000 groups per page. Big enough to amortize the round trip, small enough that
// one page of buckets doesn't make the coordinating node sweat.
fn default_page_size() -> usize {
    2000
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for CommonSourceConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl CommonSourceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ============================================================
// 🚰 CommonSinkConfig: shared sink-side knobs
// ============================================================

/// 🚰 Shared configuration embedded by every sink backend config.
///
/// A batch flushes at `bulk_actions` records or `flush_interval_ms` after the last
/// flush, whichever shows up first. Like a bus that leaves when full or on schedule.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CommonSinkConfig {
    /// 📦 Records per bulk request.
    #[serde(default = "default_bulk_actions")]
    pub bulk_actions: usize,
    /// ⏱️ Max age of a partially-filled batch, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// ⏱️ Per-request timeout for bulk writes.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 🫁 Gzip the bulk body. Bytes are squishy; squish them.
    #[serde(default)]
    pub compress: bool,
}

fn default_bulk_actions() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    1000
}

impl Default for CommonSinkConfig {
    fn default() -> Self {
        CommonSinkConfig {
            bulk_actions: default_bulk_actions(),
            flush_interval_ms: default_flush_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            compress: false,
        }
    }
}

impl CommonSinkConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
