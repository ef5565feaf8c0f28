// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Custom resource discovery actor.
//!
//! Resource discovery itself is external: a [`Discoverer`] watches the API
//! server for custom resource definitions and refreshes the metric stores
//! when they change. The actor owns the cancellation of both hooks.

use std::sync::Arc;

use async_trait::async_trait;
use serde_yaml::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::actor_group::ActorGroup;
use crate::error::BoxError;
use crate::options::Options;
use crate::store::{MetricsHandler, StoreBuilder};
use crate::telemetry::SelfMetrics;

/// How to reach the API server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KubeConfig {
    pub apiserver: String,
    pub kubeconfig: String,
}

impl From<&Options> for KubeConfig {
    fn from(options: &Options) -> Self {
        Self {
            apiserver: options.apiserver.clone(),
            kubeconfig: options.kubeconfig.clone(),
        }
    }
}

/// Everything a cache refresh needs to rebuild the stores.
#[derive(Clone)]
pub struct PollContext {
    pub options: Arc<Options>,
    pub store_builder: Arc<StoreBuilder>,
    pub handler: Arc<MetricsHandler>,
    pub custom_resource_config: Value,
    /// Registry of the CRD add/delete counters and cache gauge.
    pub metrics: Arc<SelfMetrics>,
}

#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Start watching for resource definitions. Returns once the watch is
    /// established; the watch itself stops when `token` is cancelled.
    async fn start_discovery(&self, token: CancellationToken, kube_config: &KubeConfig) -> Result<(), BoxError>;

    /// Refresh the stores whenever the discovered set changes, until `token`
    /// is cancelled.
    async fn poll_for_cache_updates(&self, token: CancellationToken, ctx: PollContext) -> Result<(), BoxError>;
}

/// Runs a [`Discoverer`] as an actor.
pub struct DiscoveryPollingActor {
    discoverer: Arc<dyn Discoverer>,
    kube_config: KubeConfig,
    ctx: PollContext,
}

impl DiscoveryPollingActor {
    pub fn new(discoverer: Arc<dyn Discoverer>, kube_config: KubeConfig, ctx: PollContext) -> Self {
        Self {
            discoverer,
            kube_config,
            ctx,
        }
    }

    /// Register this actor in `group`, deriving its token from `parent`.
    pub fn register(self, group: &mut ActorGroup, parent: &CancellationToken) {
        let token = parent.child_token();
        group.add_cancellable("discovery", token.clone(), self.run(token));
    }

    /// Run discovery until `token` is cancelled or a hook fails.
    pub async fn run(self, token: CancellationToken) -> Result<(), BoxError> {
        let _guard = token.clone().drop_guard();

        if let Err(e) = self
            .discoverer
            .start_discovery(token.clone(), &self.kube_config)
            .await
        {
            error!("Failed to start custom resource discovery: {}", e);
            return Err(e);
        }
        info!("Started custom resource discovery");

        tokio::select! {
            () = token.cancelled() => {
                debug!("Custom resource discovery interrupted");
                Ok(())
            }
            res = self.discoverer.poll_for_cache_updates(token.clone(), self.ctx) => {
                match res {
                    Ok(()) if token.is_cancelled() => Ok(()),
                    Ok(()) => {
                        debug!("Cache update poll returned, waiting for interrupt");
                        token.cancelled().await;
                        Ok(())
                    }
                    Err(e) => {
                        error!("Custom resource cache update poll failed: {}", e);
                        Err(e)
                    }
                }
            }
        }
    }
}
