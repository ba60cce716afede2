//! Server monitoring feed.
//!
//! Keeps the latest metrics, performance trends and alerts per server, plus
//! the most recent status summary, for the `gen/server` topic.
//!
//! | Message type | Cache | Capacity |
//! |--------------|-------|----------|
//! | `server_metrics` | [`METRICS_DOMAIN`] | [`METRICS_CAPACITY`] |
//! | `performance_trends` | [`TRENDS_DOMAIN`] | [`TRENDS_CAPACITY`] |
//! | `server_alerts` | [`ALERTS_DOMAIN`] | [`ALERTS_CAPACITY`] |
//! | `server_status_summary` | latest value only | - |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::cache::{ALERTS_CAPACITY, CacheReader, METRICS_CAPACITY, TRENDS_CAPACITY};
use crate::channel::{Channel, Params, Subscription};
use crate::dispatch::{HandlerError, HandlerGuard};
use crate::error::Result;
use crate::identifiers::CacheKey;
use crate::protocol::MessageEnvelope;

// ============================================================================
// Constants
// ============================================================================

/// Topic carrying server monitoring updates.
pub const SERVER_TOPIC: &str = "gen/server";

/// Cache domain of per-server metrics.
pub const METRICS_DOMAIN: &str = "server_metrics";

/// Cache domain of per-server performance trends.
pub const TRENDS_DOMAIN: &str = "performance_trends";

/// Cache domain of per-server alerts.
pub const ALERTS_DOMAIN: &str = "server_alerts";

// ============================================================================
// Types
// ============================================================================

/// Performance trend of one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceTrend {
    /// Server id.
    pub server_id: CacheKey,
    /// Display name, when the server sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Trend series as sent by the server.
    pub trends: Value,
}

/// Active alerts of one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAlerts {
    /// Server id.
    pub server_id: CacheKey,
    /// Display name, when the server sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Alert records.
    pub alerts: Vec<Value>,
}

// ============================================================================
// ServerMetricsFeed
// ============================================================================

/// Server monitoring state fed by a [`Channel`].
///
/// Dropping the feed unregisters its handlers and releases the topic. The
/// caches stay readable through [`Channel::cache`].
#[derive(Debug)]
pub struct ServerMetricsFeed {
    metrics: CacheReader<Value>,
    trends: CacheReader<PerformanceTrend>,
    alerts: CacheReader<ServerAlerts>,
    summary: Arc<Mutex<Option<Value>>>,
    _handlers: Vec<HandlerGuard>,
    _topic: Subscription,
}

impl ServerMetricsFeed {
    /// Installs the feed handlers and subscribes to [`SERVER_TOPIC`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if one of the cache
    /// domains is already used with another value type.
    pub fn attach(channel: &Channel) -> Result<Self> {
        Self::attach_with(channel, Params::new())
    }

    /// Like [`Self::attach`], with subscription parameters (e.g. a server id).
    ///
    /// # Errors
    ///
    /// Same as [`Self::attach`].
    pub fn attach_with(channel: &Channel, params: Params) -> Result<Self> {
        let (metrics, metrics_guard) =
            channel.on_cached("server_metrics", METRICS_DOMAIN, METRICS_CAPACITY, |envelope| {
                Ok(keyed(envelope).map(|(key, data)| (key, data.clone())))
            })?;

        let (trends, trends_guard) =
            channel.on_cached("performance_trends", TRENDS_DOMAIN, TRENDS_CAPACITY, |envelope| {
                Ok(keyed(envelope).map(|(server_id, data)| {
                    let trend = PerformanceTrend {
                        server_id: server_id.clone(),
                        server_name: server_name(envelope),
                        trends: data.clone(),
                    };
                    (server_id, trend)
                }))
            })?;

        let (alerts, alerts_guard) =
            channel.on_cached("server_alerts", ALERTS_DOMAIN, ALERTS_CAPACITY, |envelope| {
                let Some((server_id, data)) = keyed(envelope) else {
                    return Ok(None);
                };
                let alerts = match data.get("alerts") {
                    Some(list) => Vec::<Value>::deserialize(list).map_err(HandlerError::Shape)?,
                    None => Vec::new(),
                };
                let entry = ServerAlerts {
                    server_id: server_id.clone(),
                    server_name: server_name(envelope),
                    alerts,
                };
                Ok(Some((server_id, entry)))
            })?;

        let summary = Arc::new(Mutex::new(None));
        let latest = Arc::clone(&summary);
        let summary_guard = channel.on("server_status_summary", move |envelope| {
            if !envelope.data.is_null() {
                *latest.lock() = Some(envelope.data.clone());
            }
            Ok(())
        });

        let topic = channel.subscribe(SERVER_TOPIC, params);
        debug!(topic = SERVER_TOPIC, "Server metrics feed attached");

        Ok(Self {
            metrics,
            trends,
            alerts,
            summary,
            _handlers: vec![metrics_guard, trends_guard, alerts_guard, summary_guard],
            _topic: topic,
        })
    }

    /// Latest metrics of a server.
    #[must_use]
    pub fn metrics(&self, server_id: &CacheKey) -> Option<Value> {
        self.metrics.get(server_id)
    }

    /// Latest metrics of every cached server, oldest update first.
    #[must_use]
    pub fn all_metrics(&self) -> Vec<Value> {
        self.metrics.values()
    }

    /// Performance trend of a server.
    #[must_use]
    pub fn trend(&self, server_id: &CacheKey) -> Option<PerformanceTrend> {
        self.trends.get(server_id)
    }

    /// Alerts of a server.
    #[must_use]
    pub fn alerts(&self, server_id: &CacheKey) -> Option<ServerAlerts> {
        self.alerts.get(server_id)
    }

    /// Alerts of every cached server, oldest update first.
    #[must_use]
    pub fn all_alerts(&self) -> Vec<ServerAlerts> {
        self.alerts.values()
    }

    /// Most recent status summary.
    #[must_use]
    pub fn summary(&self) -> Option<Value> {
        self.summary.lock().clone()
    }

    /// Reader of the metrics cache.
    #[inline]
    #[must_use]
    pub fn metrics_reader(&self) -> &CacheReader<Value> {
        &self.metrics
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Server id and non-null data of an envelope.
fn keyed(envelope: &MessageEnvelope) -> Option<(CacheKey, &Value)> {
    let server_id = envelope.field("serverId").and_then(CacheKey::from_json)?;
    if envelope.data.is_null() {
        return None;
    }
    Some((server_id, &envelope.data))
}

fn server_name(envelope: &MessageEnvelope) -> Option<String> {
    envelope
        .field("serverName")
        .and_then(Value::as_str)
        .map(str::to_string)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use tokio::time::sleep;

    use crate::transport::{MemoryRemote, MemoryTransport};

    async fn attached() -> (Channel, MemoryRemote, ServerMetricsFeed) {
        let (transport, remote) = MemoryTransport::pair();
        let channel = Channel::builder()
            .address("mem://monitor")
            .transport(transport)
            .build()
            .expect("build");
        let feed = ServerMetricsFeed::attach(&channel).expect("attach");
        channel.connect().await.expect("connect");
        (channel, remote, feed)
    }

    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribes_to_server_topic() {
        let (_channel, remote, _feed) = attached().await;
        let subscribes: Vec<Value> = remote
            .sent_json()
            .into_iter()
            .filter(|v| v["type"] == json!("subscribe"))
            .collect();
        assert_eq!(subscribes.len(), 1);
        assert_eq!(subscribes[0]["topicId"], json!(SERVER_TOPIC));
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_keyed_by_server() {
        let (_channel, remote, feed) = attached().await;

        remote.push_json(&json!({"type": "server_metrics", "serverId": 7, "data": {"cpu": 12.5}}));
        remote.push_json(&json!({"type": "server_metrics", "serverId": 7, "data": {"cpu": 40.0}}));
        remote.push_json(&json!({"type": "server_metrics", "data": {"serverId": "db-1", "cpu": 3.0}}));
        remote.push_json(&json!({"type": "server_metrics", "serverId": 9}));
        settle().await;

        assert_eq!(feed.metrics(&CacheKey::from(7)), Some(json!({"cpu": 40.0})));
        assert!(feed.metrics(&CacheKey::from("db-1")).is_some());
        assert!(feed.metrics(&CacheKey::from(9)).is_none());
        assert_eq!(feed.all_metrics().len(), 2);
        assert_eq!(feed.metrics_reader().capacity(), METRICS_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trends_and_alerts() {
        let (_channel, remote, feed) = attached().await;

        remote.push_json(&json!({
            "type": "performance_trends",
            "serverId": 1,
            "serverName": "web-1",
            "data": {"cpu": [1, 2, 3]}
        }));
        remote.push_json(&json!({
            "type": "server_alerts",
            "serverId": 1,
            "data": {"alerts": [{"level": "warn"}]}
        }));
        remote.push_json(&json!({
            "type": "server_alerts",
            "serverId": 2,
            "data": {"alerts": "not a list"}
        }));
        settle().await;

        let trend = feed.trend(&CacheKey::from(1)).expect("trend");
        assert_eq!(trend.server_name.as_deref(), Some("web-1"));
        assert_eq!(trend.trends, json!({"cpu": [1, 2, 3]}));

        let alerts = feed.alerts(&CacheKey::from(1)).expect("alerts");
        assert_eq!(alerts.alerts, vec![json!({"level": "warn"})]);
        assert!(feed.alerts(&CacheKey::from(2)).is_none());
        assert_eq!(feed.all_alerts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_keeps_latest() {
        let (_channel, remote, feed) = attached().await;
        assert!(feed.summary().is_none());

        remote.push_json(&json!({"type": "server_status_summary", "data": {"online": 3}}));
        remote.push_json(&json!({"type": "server_status_summary", "data": {"online": 4}}));
        remote.push_json(&json!({"type": "server_status_summary"}));
        settle().await;

        assert_eq!(feed.summary(), Some(json!({"online": 4})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_topic_keeps_cache() {
        let (channel, remote, feed) = attached().await;
        remote.push_json(&json!({"type": "server_metrics", "serverId": 1, "data": {}}));
        settle().await;

        drop(feed);
        let unsubscribed = remote
            .sent_json()
            .into_iter()
            .any(|v| v["type"] == json!("unsubscribe") && v["topicId"] == json!(SERVER_TOPIC));
        assert!(unsubscribed);

        let reader = channel.cache::<Value>(METRICS_DOMAIN).expect("cache");
        assert_eq!(reader.len(), 1);
    }
}
