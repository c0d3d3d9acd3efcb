//! Idle detection.
//!
//! A scan walks every workspace namespace, asks the workspace health endpoint
//! when it last saw traffic and marks long-idle workspaces `unused`. Marking
//! only touches the usage record; reclaiming compute is left to whoever reads
//! it.

use crate::cluster::ClusterApi;
use crate::error::{OrchestratorError, Result};
use crate::naming;
use crate::store::{StateStore, UsageRecord, UsageStatus};
use crate::workspace::{pod_ip, pod_phase, primary_pod};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use k8s_openapi::api::core::v1::Namespace;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_THRESHOLD_HOURS: f64 = 24.0;
pub const TRACKER_MARKER: &str = "usage-tracker";

/// What the workspace health endpoint reported.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub ok: bool,
    pub last_hit: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    last_hit: Option<String>,
}

/// Accepts RFC 3339 timestamps and naive ISO-8601 ones, which are taken as
/// UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

impl HealthReport {
    pub fn from_json(body: &str) -> Result<Self> {
        let response: HealthResponse = serde_json::from_str(body)
            .map_err(|e| OrchestratorError::Health(format!("unreadable health response: {e}")))?;
        let last_hit = match response.last_hit.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(raw) => Some(parse_timestamp(raw).ok_or_else(|| {
                OrchestratorError::Health(format!("unparseable last_hit {raw:?}"))
            })?),
            None => None,
        };
        Ok(Self {
            ok: response.ok,
            last_hit,
        })
    }

    /// Rejects a report whose endpoint says it is not healthy; its
    /// `last_hit` cannot be trusted.
    pub fn require_ok(self) -> Result<Self> {
        if !self.ok {
            return Err(OrchestratorError::Health(
                "health endpoint reported not ok".to_string(),
            ));
        }
        Ok(self)
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, pod_ip: &str) -> Result<HealthReport>;
}

/// Polls `http://<pod-ip>:8445/health`.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    port: u16,
}

impl HttpHealthProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .map_err(|e| OrchestratorError::Health(e.to_string()))?;
        Ok(Self {
            client,
            port: naming::HEALTH_PORT,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, pod_ip: &str) -> Result<HealthReport> {
        let url = format!("http://{pod_ip}:{}/health", self.port);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OrchestratorError::Health(format!("{url}: {e}")))?
            .error_for_status()
            .map_err(|e| OrchestratorError::Health(format!("{url}: {e}")))?;
        let body = response
            .text()
            .await
            .map_err(|e| OrchestratorError::Health(format!("{url}: {e}")))?;
        HealthReport::from_json(&body)?.require_ok()
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub threshold_hours: f64,
    pub marked_by: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            threshold_hours: DEFAULT_THRESHOLD_HOURS,
            marked_by: TRACKER_MARKER.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    MarkUnused(String),
    KeepActive(String),
}

fn hours_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_seconds() as f64 / 3600.0
}

/// Idle rule: a workspace never hit is idle once older than the threshold; a
/// workspace that was hit is idle once its last hit is older than the
/// threshold.
pub fn decide(
    created: DateTime<Utc>,
    last_hit: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold_hours: f64,
) -> Decision {
    let age = hours_between(created, now);
    match last_hit {
        None if age > threshold_hours => {
            Decision::MarkUnused(format!("no traffic since creation (age ≈ {age:.1}h)"))
        }
        None => Decision::KeepActive(format!(
            "no traffic yet, age {age:.1}h within {threshold_hours}h"
        )),
        Some(hit) => {
            let idle = hours_between(hit, now);
            if idle > threshold_hours {
                Decision::MarkUnused(format!("no traffic for ≈{idle:.1} hours"))
            } else {
                Decision::KeepActive(format!("last traffic {idle:.1}h ago"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ScanOutcome {
    MarkedUnused(String),
    KeptActive(String),
    AlreadyUnused,
    Skipped(String),
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceScan {
    pub namespace: String,
    pub workspace_id: Option<String>,
    pub outcome: ScanOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub marked_unused: usize,
    pub kept_active: usize,
    pub errors: usize,
    /// Includes workspaces that were already unused.
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub scanned_at: DateTime<Utc>,
    pub results: Vec<WorkspaceScan>,
    pub summary: ScanSummary,
}

impl ScanReport {
    fn new(scanned_at: DateTime<Utc>, results: Vec<WorkspaceScan>) -> Self {
        let mut summary = ScanSummary::default();
        for result in &results {
            match result.outcome {
                ScanOutcome::MarkedUnused(_) => summary.marked_unused += 1,
                ScanOutcome::KeptActive(_) => summary.kept_active += 1,
                ScanOutcome::Error(_) => summary.errors += 1,
                ScanOutcome::AlreadyUnused | ScanOutcome::Skipped(_) => summary.skipped += 1,
            }
        }
        Self {
            scanned_at,
            results,
            summary,
        }
    }

    pub fn outcome_for(&self, namespace: &str) -> Option<&ScanOutcome> {
        self.results
            .iter()
            .find(|r| r.namespace == namespace)
            .map(|r| &r.outcome)
    }
}

pub struct UsageTracker {
    cluster: Arc<dyn ClusterApi>,
    store: StateStore,
    probe: Arc<dyn HealthProbe>,
    config: TrackerConfig,
}

impl UsageTracker {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        probe: Arc<dyn HealthProbe>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            store: StateStore::new(cluster.clone()),
            cluster,
            probe,
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub async fn scan(&self) -> Result<ScanReport> {
        self.scan_at(Utc::now()).await
    }

    /// One pass over every workspace namespace. Per-workspace failures are
    /// reported in the result and never stop the pass.
    #[instrument(skip(self), fields(threshold_hours = self.config.threshold_hours))]
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let namespaces = self
            .cluster
            .list_namespaces(naming::WORKSPACE_NAMESPACE_SELECTOR)
            .await?;

        let mut results = Vec::with_capacity(namespaces.len());
        for ns in &namespaces {
            let name = ns.metadata.name.clone().unwrap_or_default();
            let workspace_id = ns
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(naming::WORKSPACE_ID_LABEL))
                .cloned();

            let outcome = match &workspace_id {
                None => ScanOutcome::Skipped(format!(
                    "missing {} label",
                    naming::WORKSPACE_ID_LABEL
                )),
                Some(_) => self
                    .scan_workspace(ns, &name, now)
                    .await
                    .unwrap_or_else(|err| ScanOutcome::Error(err.to_string())),
            };

            match &outcome {
                ScanOutcome::MarkedUnused(reason) => {
                    info!(namespace = %name, %reason, "marked workspace unused")
                }
                ScanOutcome::KeptActive(reason) => {
                    debug!(namespace = %name, %reason, "workspace still active")
                }
                ScanOutcome::AlreadyUnused => {
                    debug!(namespace = %name, "workspace already unused")
                }
                ScanOutcome::Skipped(reason) => {
                    warn!(namespace = %name, %reason, "skipping workspace")
                }
                ScanOutcome::Error(error) => {
                    warn!(namespace = %name, %error, "usage check failed")
                }
            }

            results.push(WorkspaceScan {
                namespace: name,
                workspace_id,
                outcome,
            });
        }

        let report = ScanReport::new(now, results);
        info!(
            marked_unused = report.summary.marked_unused,
            kept_active = report.summary.kept_active,
            errors = report.summary.errors,
            skipped = report.summary.skipped,
            "usage scan complete"
        );
        Ok(report)
    }

    async fn scan_workspace(
        &self,
        ns: &Namespace,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<ScanOutcome> {
        match self.store.usage(namespace).await? {
            Some(usage) if usage.status == UsageStatus::Active => {}
            _ => return Ok(ScanOutcome::AlreadyUnused),
        }

        let pods = self
            .cluster
            .list_pods(namespace, naming::WORKSPACE_POD_SELECTOR)
            .await?;
        let Some(pod) = primary_pod(&pods).filter(|p| pod_phase(p) == Some("Running")) else {
            return Ok(ScanOutcome::Skipped("no running workspace pod".to_string()));
        };
        let Some(ip) = pod_ip(pod) else {
            return Ok(ScanOutcome::Skipped("workspace pod has no IP yet".to_string()));
        };

        let deployment = self
            .cluster
            .get_deployment(namespace, naming::DEPLOYMENT_NAME)
            .await?;
        let created = deployment
            .as_ref()
            .and_then(|d| d.metadata.creation_timestamp.as_ref())
            .or(pod.metadata.creation_timestamp.as_ref())
            .or(ns.metadata.creation_timestamp.as_ref())
            .map(|t| t.0)
            .ok_or_else(|| {
                OrchestratorError::InvalidState(format!("no creation time for {namespace}"))
            })?;

        let health = self.probe.check(ip).await?.require_ok()?;

        let reason = match decide(created, health.last_hit, now, self.config.threshold_hours) {
            Decision::KeepActive(reason) => return Ok(ScanOutcome::KeptActive(reason)),
            Decision::MarkUnused(reason) => reason,
        };

        let record = UsageRecord {
            status: UsageStatus::Unused,
            marked_at: now,
            marked_by: self.config.marked_by.clone(),
            reason: reason.clone(),
        };
        // Only flip a record that is still active; a concurrent start wins.
        let written = self
            .store
            .modify::<UsageRecord, _>(namespace, |current| {
                Ok(current
                    .filter(|u| u.status == UsageStatus::Active)
                    .map(|_| record.clone()))
            })
            .await?;

        Ok(if written {
            ScanOutcome::MarkedUnused(reason)
        } else {
            ScanOutcome::AlreadyUnused
        })
    }
}
