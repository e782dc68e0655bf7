//! Attack heuristics.
//!
//! # Responsibilities
//! - Reject bot-like User-Agents and requests matching injection signatures
//! - Flag per-client volume above the per-minute threshold
//! - Flag irregular request timing and abrupt geographic relocation
//!
//! Checks run in that order and stop at the first positive signal. Store
//! failures and malformed records count as "no signal".

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::DdosConfig;
use crate::security::geo::{haversine_km, GeoLookup};
use crate::store::{CounterStore, StoreError};

/// One-second buckets summed for the volume signal.
pub const VOLUME_WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    ScriptInjection,
    PathTraversal,
    SensitiveFile,
    CommandExec,
    DangerousPunctuation,
}

impl SignatureKind {
    fn pattern(self) -> &'static str {
        match self {
            Self::ScriptInjection => r"(?i)(<|%3c)\s*script|javascript:|\bon(error|load)\s*=",
            Self::PathTraversal => r"(?i)\.\./|\.\.\\|%2e%2e(/|%2f|\\|%5c)",
            Self::SensitiveFile => {
                r"(?i)/etc/(passwd|shadow)|/\.env\b|/\.git/|wp-config\.php|\.htaccess|\.htpasswd"
            }
            Self::CommandExec => {
                r"(?i)\b(exec|system|passthru|shell_exec|popen|eval)\s*\(|;\s*(ls|cat|rm|wget|curl|nc)\b"
            }
            Self::DangerousPunctuation => r"[<>`]|\$\{|\$\(",
        }
    }

    const ALL: [SignatureKind; 5] = [
        Self::ScriptInjection,
        Self::PathTraversal,
        Self::SensitiveFile,
        Self::CommandExec,
        Self::DangerousPunctuation,
    ];
}

/// Why a request was flagged.
#[derive(Debug, Clone, PartialEq)]
pub enum AttackSignal {
    BlockedUserAgent(String),
    Signature(SignatureKind),
    Volume { requests_per_minute: u64 },
    IrregularPattern { samples: u64, stddev_secs: f64 },
    Burst { count: u64, interval_ms: u64 },
    GeoAnomaly { from: String, to: String, distance_km: f64 },
}

impl AttackSignal {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::BlockedUserAgent(_) => "user_agent",
            Self::Signature(_) => "signature",
            Self::Volume { .. } => "volume",
            Self::IrregularPattern { .. } | Self::Burst { .. } => "pattern",
            Self::GeoAnomaly { .. } => "geo",
        }
    }
}

/// Rolling per-client request timing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPatternRecord {
    pub count: u64,
    pub last_request_ms: u64,
    /// Inter-arrival interval in whole seconds → occurrences.
    pub intervals: BTreeMap<u64, u64>,
}

impl RequestPatternRecord {
    pub fn samples(&self) -> u64 {
        self.intervals.values().sum()
    }

    /// Standard deviation of the interval histogram, in seconds.
    pub fn interval_stddev(&self) -> f64 {
        let n = self.samples();
        if n == 0 {
            return 0.0;
        }
        let n = n as f64;
        let mean = self
            .intervals
            .iter()
            .map(|(secs, hits)| *secs as f64 * *hits as f64)
            .sum::<f64>()
            / n;
        let variance = self
            .intervals
            .iter()
            .map(|(secs, hits)| (*secs as f64 - mean).powi(2) * *hits as f64)
            .sum::<f64>()
            / n;
        variance.sqrt()
    }
}

/// Last sighting of a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug)]
pub struct AttackDetector {
    config: DdosConfig,
    user_agents: Vec<String>,
    signatures: Vec<(SignatureKind, Regex)>,
    store: Arc<dyn CounterStore>,
    geo: Arc<dyn GeoLookup>,
}

impl AttackDetector {
    pub fn new(
        config: &DdosConfig,
        store: Arc<dyn CounterStore>,
        geo: Arc<dyn GeoLookup>,
    ) -> Result<Self, regex::Error> {
        let signatures = if config.signatures_enabled {
            SignatureKind::ALL
                .iter()
                .map(|kind| Regex::new(kind.pattern()).map(|re| (*kind, re)))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };
        Ok(Self {
            user_agents: config
                .blocked_user_agents
                .iter()
                .map(|ua| ua.to_ascii_lowercase())
                .collect(),
            config: config.clone(),
            signatures,
            store,
            geo,
        })
    }

    pub async fn inspect(&self, ip: IpAddr, path: &str, headers: &HeaderMap) -> Option<AttackSignal> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.inspect_at(ip, path, headers, now_ms).await
    }

    /// Run the checks in order with `now_ms` as wall-clock milliseconds,
    /// stopping at the first signal.
    pub async fn inspect_at(
        &self,
        ip: IpAddr,
        path: &str,
        headers: &HeaderMap,
        now_ms: u64,
    ) -> Option<AttackSignal> {
        if let Some(signal) = self.check_user_agent(headers) {
            tracing::warn!(client = %ip, ?signal, "Blocked bot-like User-Agent");
            return Some(signal);
        }
        if let Some(signal) = self.check_signatures(path, headers) {
            tracing::warn!(client = %ip, path, ?signal, "Request matched attack signature");
            return Some(signal);
        }

        if let Some(signal) = settle(ip, "volume", self.check_volume(ip, now_ms).await) {
            return Some(signal);
        }
        if let Some(signal) = settle(ip, "pattern", self.check_pattern(ip, now_ms).await) {
            return Some(signal);
        }
        settle(ip, "geo", self.check_geo(ip).await)
    }

    pub fn check_user_agent(&self, headers: &HeaderMap) -> Option<AttackSignal> {
        let agent = headers
            .get(axum::http::header::USER_AGENT)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).to_ascii_lowercase())
            .unwrap_or_default();
        self.user_agents
            .iter()
            .find(|blocked| agent.contains(blocked.as_str()))
            .map(|_| AttackSignal::BlockedUserAgent(agent))
    }

    pub fn check_signatures(&self, path: &str, headers: &HeaderMap) -> Option<AttackSignal> {
        if self.signatures.is_empty() {
            return None;
        }
        let serialized = serialize_headers(headers);
        self.signatures
            .iter()
            .find(|(_, re)| re.is_match(path) || re.is_match(&serialized))
            .map(|(kind, _)| AttackSignal::Signature(*kind))
    }

    async fn check_volume(&self, ip: IpAddr, now_ms: u64) -> Result<Option<AttackSignal>, StoreError> {
        let second = now_ms / 1000;
        let ttl = Duration::from_secs(VOLUME_WINDOW_SECS);
        let current = self.store.incr(&format!("{ip}:{second}"), ttl).await?;

        let earlier: Vec<String> = (1..VOLUME_WINDOW_SECS)
            .filter_map(|back| second.checked_sub(back))
            .map(|s| format!("{ip}:{s}"))
            .collect();
        let total = current
            + self
                .store
                .get_many(&earlier)
                .await?
                .into_iter()
                .flatten()
                .filter_map(|v| v.parse::<u64>().ok())
                .sum::<u64>();

        Ok((total > self.config.threshold).then_some(AttackSignal::Volume {
            requests_per_minute: total,
        }))
    }

    async fn check_pattern(&self, ip: IpAddr, now_ms: u64) -> Result<Option<AttackSignal>, StoreError> {
        let key = format!("{ip}:pattern");
        let ttl = Duration::from_secs(self.config.pattern_ttl_secs);
        let previous = self
            .store
            .get(&key)
            .await?
            .and_then(|raw| serde_json::from_str::<RequestPatternRecord>(&raw).ok());

        let Some(mut record) = previous else {
            let fresh = RequestPatternRecord {
                count: 1,
                last_request_ms: now_ms,
                intervals: BTreeMap::new(),
            };
            self.store.set(&key, encode(&fresh), ttl).await?;
            return Ok(None);
        };

        let interval_ms = now_ms.saturating_sub(record.last_request_ms);
        let prior_count = record.count;
        record.count += 1;
        record.last_request_ms = now_ms;
        if interval_ms / 1000 > self.config.pattern_idle_secs {
            record.intervals.clear();
        } else {
            *record.intervals.entry(interval_ms / 1000).or_default() += 1;
        }
        self.store.set(&key, encode(&record), ttl).await?;

        if prior_count > self.config.pattern_burst_count && interval_ms < 1000 {
            return Ok(Some(AttackSignal::Burst {
                count: prior_count,
                interval_ms,
            }));
        }
        let samples = record.samples();
        if samples >= self.config.pattern_min_samples {
            let stddev = record.interval_stddev();
            if stddev > self.config.pattern_max_stddev {
                return Ok(Some(AttackSignal::IrregularPattern {
                    samples,
                    stddev_secs: stddev,
                }));
            }
        }
        Ok(None)
    }

    async fn check_geo(&self, ip: IpAddr) -> Result<Option<AttackSignal>, StoreError> {
        let Some(location) = self.geo.lookup(ip) else {
            return Ok(None);
        };
        let key = format!("{ip}:geo");
        let previous = self
            .store
            .get(&key)
            .await?
            .and_then(|raw| serde_json::from_str::<GeoRecord>(&raw).ok());

        let current = GeoRecord {
            country: location.country,
            latitude: location.latitude,
            longitude: location.longitude,
        };
        self.store
            .set(&key, encode(&current), Duration::from_secs(self.config.geo_ttl_secs))
            .await?;

        let Some(previous) = previous else {
            return Ok(None);
        };
        let distance_km = haversine_km(
            previous.latitude,
            previous.longitude,
            current.latitude,
            current.longitude,
        );
        if previous.country != current.country || distance_km > self.config.geo_distance_km {
            return Ok(Some(AttackSignal::GeoAnomaly {
                from: previous.country,
                to: current.country,
                distance_km,
            }));
        }
        Ok(None)
    }
}

/// Log a store-backed check's outcome; errors count as no signal.
fn settle(
    ip: IpAddr,
    check: &'static str,
    result: Result<Option<AttackSignal>, StoreError>,
) -> Option<AttackSignal> {
    match result {
        Ok(Some(signal)) => {
            tracing::warn!(client = %ip, ?signal, "Possible attack detected");
            Some(signal)
        }
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(client = %ip, check, error = %e, "Attack check skipped");
            None
        }
    }
}

fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Headers as a JSON object with sorted keys, for signature matching.
fn serialize_headers(headers: &HeaderMap) -> String {
    let map: BTreeMap<&str, String> = headers
        .iter()
        .map(|(name, value)| (name.as_str(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .collect();
    serde_json::to_string(&map).unwrap_or_default()
}
