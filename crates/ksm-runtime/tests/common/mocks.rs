// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock collaborators for integration tests

use async_trait::async_trait;
use ksm_runtime::discovery::{Discoverer, KubeConfig, PollContext};
use ksm_runtime::error::BoxError;
use ksm_runtime::store::MetricStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Store serving a fixed payload
pub struct FixedStore(pub &'static str);

impl MetricStore for FixedStore {
    fn write_all(&self, out: &mut String) {
        out.push_str(self.0);
    }
}

/// Discoverer that installs one fixed store per poll and waits for cancellation
#[derive(Default)]
pub struct MockDiscoverer {
    pub started: AtomicUsize,
    pub polls: AtomicUsize,
}

#[async_trait]
impl Discoverer for MockDiscoverer {
    async fn start_discovery(
        &self,
        _token: CancellationToken,
        _kube_config: &KubeConfig,
    ) -> Result<(), BoxError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn poll_for_cache_updates(
        &self,
        token: CancellationToken,
        ctx: PollContext,
    ) -> Result<(), BoxError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        ctx.metrics.record_crd_add();
        ctx.handler
            .set_stores(vec![Arc::new(FixedStore("kube_customresource_info 1\n"))]);
        token.cancelled().await;
        Ok(())
    }
}
