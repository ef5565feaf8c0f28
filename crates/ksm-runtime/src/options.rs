// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exporter options, read from flags and `KSM_*` environment variables.
//!
//! The same structure is the target of the optional YAML config file: values
//! present in the file override the intersecting options (see
//! [`crate::config_gate`]).

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::RunError;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TELEMETRY_PORT: u16 = 8081;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Options of the kube-state-metrics exporter.
#[derive(Debug, Clone, PartialEq, Parser, Serialize, Deserialize)]
#[command(name = "kube-state-metrics", version, about = "Generate metrics about the state of Kubernetes objects")]
#[serde(default)]
pub struct Options {
    /// The URL of the apiserver to use as a master.
    #[arg(long, env = "KSM_APISERVER", default_value = "")]
    pub apiserver: String,

    /// Absolute path to the kubeconfig file.
    #[arg(long, env = "KSM_KUBECONFIG", default_value = "")]
    pub kubeconfig: String,

    /// Host to expose metrics on.
    #[arg(long, env = "KSM_HOST", default_value = "::")]
    pub host: String,

    /// Port to expose metrics on.
    #[arg(long, env = "KSM_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Host to expose kube-state-metrics self metrics on.
    #[arg(long, env = "KSM_TELEMETRY_HOST", default_value = "::")]
    pub telemetry_host: String,

    /// Port to expose kube-state-metrics self metrics on.
    #[arg(long, env = "KSM_TELEMETRY_PORT", default_value_t = DEFAULT_TELEMETRY_PORT)]
    pub telemetry_port: u16,

    /// Path to the kube-state-metrics options config file.
    #[arg(long, env = "KSM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Inline Custom Resource State Metrics config YAML.
    #[arg(long, env = "KSM_CUSTOM_RESOURCE_STATE_CONFIG")]
    pub custom_resource_config: Option<String>,

    /// Path to a Custom Resource State Metrics config file.
    #[arg(long, env = "KSM_CUSTOM_RESOURCE_STATE_CONFIG_FILE")]
    pub custom_resource_config_file: Option<PathBuf>,

    /// Only provide Custom Resource State metrics.
    #[arg(long, env = "KSM_CUSTOM_RESOURCE_STATE_ONLY")]
    pub custom_resources_only: bool,

    /// Comma-separated list of resources to be enabled.
    #[arg(long, env = "KSM_RESOURCES", value_delimiter = ',')]
    pub resources: Vec<String>,

    /// Comma-separated list of namespaces to be enabled. Empty means all.
    #[arg(long, env = "KSM_NAMESPACES", value_delimiter = ',')]
    pub namespaces: Vec<String>,

    /// Comma-separated list of namespaces not to be enabled.
    #[arg(long, env = "KSM_NAMESPACES_DENYLIST", value_delimiter = ',')]
    pub namespaces_denylist: Vec<String>,

    /// Name of the node that contains the kube-state-metrics pod.
    #[arg(long, env = "KSM_NODE", default_value = "")]
    pub node: String,

    /// Comma-separated list of metrics to be exposed. Mutually exclusive with the denylist.
    #[arg(long, env = "KSM_METRIC_ALLOWLIST", value_delimiter = ',')]
    pub metric_allowlist: Vec<String>,

    /// Comma-separated list of metrics not to be enabled.
    #[arg(long, env = "KSM_METRIC_DENYLIST", value_delimiter = ',')]
    pub metric_denylist: Vec<String>,

    /// Comma-separated list of experimental metrics which are opted-in.
    #[arg(long, env = "KSM_METRIC_OPT_IN_LIST", value_delimiter = ',')]
    pub metric_opt_in_list: Vec<String>,

    /// Kubernetes label keys exposed per resource, e.g. `pods=[app,team],nodes=[*]`.
    #[arg(long, env = "KSM_METRIC_LABELS_ALLOWLIST", default_value = "")]
    pub labels_allow_list: String,

    /// Kubernetes annotation keys exposed per resource, e.g. `pods=[owner]`.
    #[arg(long, env = "KSM_METRIC_ANNOTATIONS_ALLOWLIST", default_value = "")]
    pub annotations_allow_list: String,

    /// The instance's shard index.
    #[arg(long, env = "KSM_SHARD", default_value_t = 0)]
    pub shard: u32,

    /// The total number of shards.
    #[arg(long, env = "KSM_TOTAL_SHARDS", default_value_t = 1)]
    pub total_shards: u32,

    /// Serve lists and watches from the API server cache.
    #[arg(long, env = "KSM_USE_APISERVER_CACHE")]
    pub use_apiserver_cache: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "KSM_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            apiserver: String::new(),
            kubeconfig: String::new(),
            host: "::".to_string(),
            port: DEFAULT_PORT,
            telemetry_host: "::".to_string(),
            telemetry_port: DEFAULT_TELEMETRY_PORT,
            config: None,
            custom_resource_config: None,
            custom_resource_config_file: None,
            custom_resources_only: false,
            resources: Vec::new(),
            namespaces: Vec::new(),
            namespaces_denylist: Vec::new(),
            node: String::new(),
            metric_allowlist: Vec::new(),
            metric_denylist: Vec::new(),
            metric_opt_in_list: Vec::new(),
            labels_allow_list: String::new(),
            annotations_allow_list: String::new(),
            shard: 0,
            total_shards: 1,
            use_apiserver_cache: false,
            log_level: "info".to_string(),
        }
    }
}

impl Options {
    /// Validate the options
    pub fn validate(&self) -> Result<(), RunError> {
        if self.total_shards == 0 {
            return Err(RunError::InvalidConfig(
                "total shards must be greater than 0".to_string(),
            ));
        }

        if self.shard >= self.total_shards {
            return Err(RunError::InvalidConfig(format!(
                "shard {} must be lower than total shards {}",
                self.shard, self.total_shards
            )));
        }

        if self.port != 0 && self.port == self.telemetry_port && self.host == self.telemetry_host {
            return Err(RunError::InvalidConfig(
                "metrics and telemetry servers must not share an address".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(RunError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Config file path, if one was given and is not empty.
    pub fn config_file(&self) -> Option<PathBuf> {
        self.config
            .as_ref()
            .filter(|path| !path.as_os_str().is_empty())
            .cloned()
    }

    /// Namespaces to watch. An empty list means all namespaces.
    pub fn watched_namespaces(&self) -> Vec<String> {
        self.namespaces
            .iter()
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty())
            .collect()
    }

    /// Field selector excluding the denylisted namespaces. Only applies when
    /// every namespace is watched.
    pub fn namespace_field_selector(&self) -> String {
        if !self.watched_namespaces().is_empty() {
            return String::new();
        }
        self.namespaces_denylist
            .iter()
            .map(|ns| ns.trim())
            .filter(|ns| !ns.is_empty())
            .map(|ns| format!("metadata.namespace!={ns}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Field selector restricting pods to the configured node.
    pub fn node_field_selector(&self) -> String {
        if self.node.is_empty() {
            return String::new();
        }
        format!("spec.nodeName={}", self.node)
    }
}
