//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! *Previously, on Rollup...*
//!
//! 🎬 COLD OPEN: INT. SERVER ROOM: 3:47 AM
//!
//! Forty million flight records sit in an index, unaggregated and smug. Somebody wants to
//! know how many of them were late, per carrier, per month, per airport. Somebody wants it
//! by morning. Somebody has never heard of a composite aggregation, and that is fine,
//! because this module has.
//!
//! 🚀 Two halves live here:
//! - [`ElasticsearchSource`]: composite aggregations with `after` tokens for the grouped
//!   query, and a plain `_search` for pulling small lookup collections at startup.
//! - [`ElasticsearchSink`]: `_bulk` upserts keyed by `_id`, optional gzip, per-item failure
//!   parsing, and create-the-index-if-it's-missing on startup.
//!
//! 🔒 Auth is the same dance on both sides: API key wins, basic auth is the fallback,
//! and anonymous is a prayer.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

mod elasticsearch_sink;
mod elasticsearch_source;

pub use elasticsearch_sink::{ElasticsearchSink, ElasticsearchSinkConfig};
pub use elasticsearch_source::{ElasticsearchSource, ElasticsearchSourceConfig};

/// 🔒 The credentials both halves carry. Borrowed, never owned; the configs own them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Credentials<'a> {
    pub api_key: Option<&'a str>,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
}

impl Credentials<'_> {
    /// 🔒 API key beats basic auth in this club. No credentials, no header.
    pub(crate) fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(api_key) = self.api_key {
            request.header("Authorization", format!("ApiKey {}", api_key))
        } else if let Some(username) = self.username {
            request.basic_auth(username, self.password)
        } else {
            request
        }
    }
}

/// 🔧 10 seconds to shake hands, `request_timeout` to finish the conversation.
/// A timeout is an error, never an empty page.
pub(crate) fn build_client(request_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(request_timeout)
        .build()
        .context("💀 The HTTP client refused to be born. The TLS stack wept. We tried to build a reqwest::Client and the universe said 'no'.")
}

/// 📡 "Hello? Is this thing on?" GET the cluster root so a bad URL or bad credentials fail
/// now, not forty pages deep.
pub(crate) async fn ping(
    client: &reqwest::Client,
    url: &str,
    credentials: Credentials<'_>,
) -> Result<()> {
    let response = credentials
        .apply(client.get(url))
        .send()
        .await
        .with_context(|| format!("💀 Knocked on '{url}'. Nobody answered. Is the cluster up? Is the URL right? Is the firewall on a power trip again?"))?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("💀 Cluster at '{url}' answered the ping with HTTP {status}. That's a no. Check credentials.");
    }
    debug!("✅ Cluster at {url} answered the ping. It lives.");
    Ok(())
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_slashes_are_not_doubled() {
        assert_eq!(endpoint("http://es:9200/", "/_bulk"), "http://es:9200/_bulk");
        assert_eq!(endpoint("http://es:9200", "markets/_search"), "http://es:9200/markets/_search");
    }
}
