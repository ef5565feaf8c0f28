// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reload gate around configuration decoding.
//!
//! A configuration that fails to decode must not crash the process: the
//! failure is surfaced through the `last_config_reload_successful` gauge and
//! the logs, and the caller is parked until the lifecycle is cancelled. A
//! corrected configuration is then picked up by the next lifecycle.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_yaml::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::ConfigError;
use crate::telemetry::{md5_hash_as_metric_value, SelfMetrics};

/// Reload-state type label of the options config file.
pub const OPTIONS_CONFIG_TYPE: &str = "config";
/// Reload-state type label of the custom resource state config file.
pub const CUSTOM_RESOURCE_CONFIG_TYPE: &str = "customresourceconfig";

/// Decodes configuration sources and records their reload state.
#[derive(Debug, Clone)]
pub struct ConfigReloadGate {
    metrics: Arc<SelfMetrics>,
}

impl ConfigReloadGate {
    pub fn new(metrics: Arc<SelfMetrics>) -> Self {
        Self { metrics }
    }

    /// Decode `bytes` on top of `target`.
    ///
    /// Values present in `bytes` override the intersecting fields of `target`;
    /// everything else keeps its current value. On success the reload state
    /// of `(config_type, filename)` is updated and the merged value returned.
    ///
    /// On failure the reload state is marked unsuccessful and this call does
    /// not return until `token` is cancelled. It then returns the decode error.
    pub async fn apply<T>(
        &self,
        target: &T,
        config_type: &str,
        filename: &str,
        bytes: &[u8],
        token: &CancellationToken,
    ) -> Result<T, ConfigError>
    where
        T: Serialize + DeserializeOwned,
    {
        match overlay(target, bytes) {
            Ok(decoded) => {
                self.mark_loaded(config_type, filename, bytes);
                Ok(decoded)
            }
            Err(source) => {
                error!("failed to unmarshal {} file {}: {}", config_type, filename, source);
                info!("misconfigured config detected, kube-state-metrics will reload once the config is fixed");
                info!("waiting for config to be fixed");
                self.metrics.record_reload_failure(config_type, filename);

                token.cancelled().await;

                Err(ConfigError {
                    config_type: config_type.to_string(),
                    filename: filename.to_string(),
                    source,
                })
            }
        }
    }

    /// Record a successful load of `bytes` that needs no decoding here.
    pub fn mark_loaded(&self, config_type: &str, filename: &str, bytes: &[u8]) {
        self.metrics
            .record_reload_success(config_type, filename, md5_hash_as_metric_value(bytes));
    }
}

fn overlay<T>(target: &T, bytes: &[u8]) -> Result<T, serde_yaml::Error>
where
    T: Serialize + DeserializeOwned,
{
    let mut merged = serde_yaml::to_value(target)?;
    let patch: Value = serde_yaml::from_slice(bytes)?;
    merge(&mut merged, patch);
    serde_yaml::from_value(merged)
}

fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (_, Value::Null) => {}
        (Value::Mapping(base), Value::Mapping(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}
