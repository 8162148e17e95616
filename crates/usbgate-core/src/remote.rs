//! Best-effort reconciliation against the remotely hosted device list.

use crate::config::UsbgateConfig;
use crate::device::DeviceId;
use crate::error::{GateError, GateResult};
use crate::registry::Registry;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

/// Fetches the authoritative identifier list from the remote endpoint.
///
/// Failures never propagate: `fetch` logs and returns an empty set so startup
/// and the monitoring loop carry on with whatever the registry already holds.
#[derive(Debug, Clone)]
pub struct RemoteSynchronizer {
    client: reqwest::Client,
    url: Option<String>,
    api_key: Option<String>,
}

impl RemoteSynchronizer {
    pub fn new(url: Option<String>, api_key: Option<String>, timeout: Duration) -> GateResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty()),
            api_key,
        })
    }

    pub fn from_config(config: &UsbgateConfig) -> GateResult<Self> {
        Self::new(
            config.remote.url.clone(),
            config.remote_api_key(),
            Duration::from_secs(config.remote.timeout_secs),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Fetch the remote identifiers, or the empty set on any failure.
    pub async fn fetch(&self) -> BTreeSet<DeviceId> {
        let Some(url) = self.url.as_deref() else {
            debug!("remote sync disabled; no remote.url configured");
            return BTreeSet::new();
        };

        match self.try_fetch(url).await {
            Ok(ids) => {
                info!("remote list returned {} device(s)", ids.len());
                ids
            }
            Err(err) => {
                warn!("skipping remote sync: {err}");
                BTreeSet::new()
            }
        }
    }

    /// Fetch and merge into `registry`; returns whether the registry changed.
    pub async fn sync_into(&self, registry: &Registry) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let ids = self.fetch().await;
        registry.merge(ids)
    }

    async fn try_fetch(&self, url: &str) -> GateResult<BTreeSet<DeviceId>> {
        let mut request = self.client.get(url).query(&[("select", "*")]);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GateError::Remote(format!("{url} answered {status}")));
        }
        let body = response.bytes().await?;
        parse_rows(&body)
    }
}

/// Extract identifiers from a JSON array of rows carrying a `value` field.
///
/// String and numeric values are accepted; rows without a usable value are
/// skipped rather than failing the whole response.
pub fn parse_rows(body: &[u8]) -> GateResult<BTreeSet<DeviceId>> {
    let rows: Vec<Value> = serde_json::from_slice(body)
        .map_err(|err| GateError::Remote(format!("unexpected response body: {err}")))?;

    let mut ids = BTreeSet::new();
    for row in rows {
        let id = match row.get("value") {
            Some(Value::String(raw)) => DeviceId::new(raw),
            Some(Value::Number(raw)) => DeviceId::new(&raw.to_string()),
            _ => None,
        };
        match id {
            Some(id) => {
                ids.insert(id);
            }
            None => debug!("ignoring remote row without a usable value: {row}"),
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> BTreeSet<DeviceId> {
        values.iter().map(|v| DeviceId::new(v).unwrap()).collect()
    }

    #[test]
    fn parse_rows_uppercases_and_normalises_values() {
        let body = br#"[
            {"id": 1, "value": "abc123"},
            {"id": 2, "value": "def-456"},
            {"id": 3, "value": 789}
        ]"#;
        assert_eq!(parse_rows(body).unwrap(), ids(&["ABC123", "DEF456", "789"]));
    }

    #[test]
    fn parse_rows_skips_rows_without_value() {
        let body = br#"[{"id": 1}, {"value": null}, {"value": ""}, "stray", {"value": "ok1"}]"#;
        assert_eq!(parse_rows(body).unwrap(), ids(&["OK1"]));
    }

    #[test]
    fn parse_rows_rejects_non_array_bodies() {
        assert!(parse_rows(br#"{"message": "unauthorized"}"#).is_err());
        assert!(parse_rows(b"<html>").is_err());
    }

    #[tokio::test]
    async fn disabled_sync_returns_empty_set() {
        let remote = RemoteSynchronizer::new(None, None, Duration::from_secs(1)).unwrap();
        assert!(!remote.is_enabled());
        assert!(remote.fetch().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_endpoint_returns_empty_set() {
        // Port 9 on loopback is reserved for discard and is normally closed.
        let remote = RemoteSynchronizer::new(
            Some("http://127.0.0.1:9/rest/v1/devices".into()),
            None,
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(remote.fetch().await.is_empty());
    }
}
