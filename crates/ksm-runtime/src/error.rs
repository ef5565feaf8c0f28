// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;

/// Error type returned by actors and external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by an [`ActorGroup`](crate::actor_group::ActorGroup).
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("actor group has no actors")]
    NoActors,

    #[error("actor group already started")]
    AlreadyStarted,

    #[error("actor {actor} panicked")]
    Panicked { actor: String },

    #[error("actor {actor} failed: {source}")]
    Actor {
        actor: String,
        #[source]
        source: BoxError,
    },
}

impl GroupError {
    /// Name of the actor that settled the group, if any.
    pub fn actor(&self) -> Option<&str> {
        match self {
            Self::Panicked { actor } | Self::Actor { actor, .. } => Some(actor),
            Self::NoActors | Self::AlreadyStarted => None,
        }
    }
}

/// Configuration decode failure reported by the reload gate.
#[derive(Debug, thiserror::Error)]
#[error("failed to decode {config_type} config {filename}: {source}")]
pub struct ConfigError {
    pub config_type: String,
    pub filename: String,
    #[source]
    pub source: serde_yaml::Error,
}

/// Errors returned while configuring the store builder.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource {0} does not exist. Available resources: {1}")]
    UnknownResource(String, String),

    #[error("invalid field selector {selector}: {reason}")]
    FieldSelector { selector: String, reason: String },

    #[error("both allowlist and denylist are defined; only one of them may be set")]
    AllowDenyConflict,

    #[error("invalid metric pattern {pattern}: {source}")]
    MetricPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid allow list {0}: expected resource=[name,...]")]
    AllowList(String),

    #[error("shard {shard} must be lower than total shards {total}")]
    Sharding { shard: u32, total: u32 },
}

/// Errors returned by one lifecycle of the exporter.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read opts config file {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Custom Resource State Metrics file could not be opened: {0}")]
    CustomResourceConfig(String),

    #[error("failed to set up store builder: {0}")]
    Setup(#[from] StoreError),

    #[error("failed to bind {name} listener on {addr}: {source}")]
    Bind {
        name: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("custom resource state config is set but no discoverer is available")]
    DiscoveryUnavailable,

    #[error("run server group error: {0}")]
    Group(#[from] GroupError),
}
