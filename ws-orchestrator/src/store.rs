//! Typed per-namespace records kept in ConfigMaps.
//!
//! The descriptor and the usage record are shared by the controller, the port
//! exposer and the usage tracker with no lock between them. Every
//! read-modify-write goes through [`StateStore::modify`], which re-reads and
//! re-applies the change whenever the guarded replace loses a race.

use crate::cluster::{ClusterApi, ClusterError};
use crate::error::{OrchestratorError, Result};
use crate::naming;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A JSON document stored under one key of a named ConfigMap.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const CONFIG_MAP: &'static str;
    const KEY: &'static str;
    const LABEL: &'static str;
    /// Whether an unreadable stored value may be replaced wholesale.
    const OVERWRITE_MALFORMED: bool;
}

/// Identity and published ports of a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorRecord {
    pub id: String,
    pub subdomain: String,
    pub fqdn: String,
    pub url: String,
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub custom_image: bool,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub port_mappings: BTreeMap<u16, String>,
}

impl Record for DescriptorRecord {
    const CONFIG_MAP: &'static str = naming::DESCRIPTOR_CONFIG_MAP;
    const KEY: &'static str = naming::DESCRIPTOR_KEY;
    const LABEL: &'static str = naming::DESCRIPTOR_LABEL;
    const OVERWRITE_MALFORMED: bool = false;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    #[serde(alias = "used")]
    Active,
    Unused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub status: UsageStatus,
    pub marked_at: DateTime<Utc>,
    pub marked_by: String,
    #[serde(default)]
    pub reason: String,
}

impl UsageRecord {
    pub fn new(status: UsageStatus, marked_by: &str, reason: impl Into<String>) -> Self {
        Self {
            status,
            marked_at: Utc::now(),
            marked_by: marked_by.to_string(),
            reason: reason.into(),
        }
    }
}

impl Record for UsageRecord {
    const CONFIG_MAP: &'static str = naming::USAGE_CONFIG_MAP;
    const KEY: &'static str = naming::USAGE_KEY;
    const LABEL: &'static str = naming::USAGE_LABEL;
    const OVERWRITE_MALFORMED: bool = true;
}

/// What a stored ConfigMap decoded to.
enum Stored<R> {
    Absent,
    Present(R, ConfigMap),
    Malformed(String, ConfigMap),
}

fn decode<R: Record>(config_map: ConfigMap) -> Stored<R> {
    let parsed = match config_map.data.as_ref().and_then(|d| d.get(R::KEY)) {
        Some(raw) => serde_json::from_str::<R>(raw).map_err(|e| e.to_string()),
        None => Err(format!("missing key {}", R::KEY)),
    };
    match parsed {
        Ok(record) => Stored::Present(record, config_map),
        Err(reason) => Stored::Malformed(reason, config_map),
    }
}

fn record_config_map<R: Record>(namespace: &str, record: &R) -> Result<ConfigMap> {
    let labels = BTreeMap::from([
        (naming::APP_LABEL.to_string(), naming::APP_WORKSPACE.to_string()),
        (naming::COMPONENT_LABEL.to_string(), R::LABEL.to_string()),
    ]);
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(R::CONFIG_MAP.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            R::KEY.to_string(),
            serde_json::to_string_pretty(record)?,
        )])),
        ..Default::default()
    })
}

#[derive(Clone)]
pub struct StateStore {
    cluster: Arc<dyn ClusterApi>,
    max_attempts: u32,
}

impl StateStore {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    async fn load<R: Record>(&self, namespace: &str) -> Result<Stored<R>> {
        Ok(match self.cluster.get_config_map(namespace, R::CONFIG_MAP).await? {
            Some(config_map) => decode(config_map),
            None => Stored::Absent,
        })
    }

    /// Reads a record. A stored but unreadable value is an error.
    pub async fn read<R: Record>(&self, namespace: &str) -> Result<Option<R>> {
        match self.load::<R>(namespace).await? {
            Stored::Absent => Ok(None),
            Stored::Present(record, _) => Ok(Some(record)),
            Stored::Malformed(reason, _) => Err(OrchestratorError::MalformedRecord {
                namespace: namespace.to_string(),
                record: R::CONFIG_MAP,
                reason,
            }),
        }
    }

    pub async fn descriptor(&self, namespace: &str) -> Result<Option<DescriptorRecord>> {
        self.read(namespace).await
    }

    pub async fn usage(&self, namespace: &str) -> Result<Option<UsageRecord>> {
        self.read(namespace).await
    }

    /// Optimistic read-modify-write.
    ///
    /// `change` sees the current record (`None` when absent) and returns the
    /// replacement, or `None` when nothing needs writing. On a conflict the
    /// record is re-read and `change` runs again. Returns whether a write
    /// landed.
    pub async fn modify<R, F>(&self, namespace: &str, mut change: F) -> Result<bool>
    where
        R: Record,
        F: FnMut(Option<&R>) -> Result<Option<R>> + Send,
    {
        for attempt in 1..=self.max_attempts {
            let (next, current) = match self.load::<R>(namespace).await? {
                Stored::Absent => (change(None)?, None),
                Stored::Present(record, config_map) => (change(Some(&record))?, Some(config_map)),
                Stored::Malformed(reason, config_map) => {
                    if !R::OVERWRITE_MALFORMED {
                        return Err(OrchestratorError::MalformedRecord {
                            namespace: namespace.to_string(),
                            record: R::CONFIG_MAP,
                            reason,
                        });
                    }
                    warn!(namespace, record = R::CONFIG_MAP, %reason, "replacing malformed record");
                    (change(None)?, Some(config_map))
                }
            };

            let Some(next) = next else {
                return Ok(false);
            };

            let outcome = match current {
                Some(mut config_map) => {
                    config_map
                        .data
                        .get_or_insert_with(BTreeMap::new)
                        .insert(R::KEY.to_string(), serde_json::to_string_pretty(&next)?);
                    self.cluster
                        .replace_config_map(namespace, &config_map)
                        .await
                        .map(|_| ())
                }
                None => {
                    let config_map = record_config_map(namespace, &next)?;
                    self.cluster
                        .create_config_map(namespace, &config_map)
                        .await
                        .map(|_| ())
                }
            };

            match outcome {
                Ok(()) => return Ok(true),
                Err(ClusterError::Conflict(_)) | Err(ClusterError::AlreadyExists(_)) => {
                    debug!(
                        namespace,
                        record = R::CONFIG_MAP,
                        attempt,
                        "lost a write race, retrying"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(OrchestratorError::ConflictRetriesExhausted {
            namespace: namespace.to_string(),
            record: R::CONFIG_MAP,
            attempts: self.max_attempts,
        })
    }

    /// Writes the descriptor unless one already exists.
    pub async fn ensure_descriptor(
        &self,
        namespace: &str,
        descriptor: &DescriptorRecord,
    ) -> Result<bool> {
        self.modify::<DescriptorRecord, _>(namespace, |current| {
            Ok(current.is_none().then(|| descriptor.clone()))
        })
        .await
    }

    /// Seeds the usage record unless one already exists.
    pub async fn seed_usage(&self, namespace: &str, usage: &UsageRecord) -> Result<bool> {
        self.modify::<UsageRecord, _>(namespace, |current| {
            Ok(current.is_none().then(|| usage.clone()))
        })
        .await
    }

    pub async fn write_usage(&self, namespace: &str, usage: &UsageRecord) -> Result<()> {
        self.modify::<UsageRecord, _>(namespace, |_| Ok(Some(usage.clone())))
            .await
            .map(|_| ())
    }

    /// Sets the usage status, leaving the record untouched when it already
    /// has `status`. Returns whether a write landed.
    pub async fn mark_usage(
        &self,
        namespace: &str,
        status: UsageStatus,
        marked_by: &str,
        reason: &str,
    ) -> Result<bool> {
        self.modify::<UsageRecord, _>(namespace, |current| {
            if current.is_some_and(|u| u.status == status) {
                return Ok(None);
            }
            Ok(Some(UsageRecord::new(status, marked_by, reason)))
        })
        .await
    }

    /// Adds `port -> url` to the descriptor's port mapping. Entries are never
    /// removed or rewritten; returns `false` when the port was already mapped.
    pub async fn add_port_mapping(&self, namespace: &str, port: u16, url: &str) -> Result<bool> {
        self.modify::<DescriptorRecord, _>(namespace, |current| {
            let Some(current) = current else {
                return Err(OrchestratorError::InvalidState(format!(
                    "{namespace} has no {} record",
                    naming::DESCRIPTOR_CONFIG_MAP
                )));
            };
            if current.port_mappings.contains_key(&port) {
                return Ok(None);
            }
            let mut next = current.clone();
            next.port_mappings.insert(port, url.to_string());
            Ok(Some(next))
        })
        .await
    }
}
