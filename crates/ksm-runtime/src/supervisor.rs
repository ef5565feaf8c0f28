// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Restart classification for one exporter lifecycle.
//!
//! A lifecycle that ends because its scope was cancelled is a restart
//! request, whatever error it surfaced on the way out. Anything else is
//! returned to the caller unchanged.

use async_trait::async_trait;
use tracing::info;

use crate::error::RunError;
use crate::scope::{CancelReason, LifecycleControl, LifecycleScope};

/// One full run of the exporter.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn run_once(&self, scope: &LifecycleScope) -> Result<(), RunError>;
}

#[derive(Debug)]
pub enum RestartDecision {
    Restart,
    Fatal(RunError),
}

/// Decide what to do with the result of a lifecycle.
pub fn classify(result: Result<(), RunError>, scope: &LifecycleScope) -> RestartDecision {
    match result {
        _ if scope.is_cancelled() => RestartDecision::Restart,
        Ok(()) => RestartDecision::Restart,
        Err(e) => RestartDecision::Fatal(e),
    }
}

/// Runs a [`Lifecycle`] and turns cancellation into a clean return.
pub struct RestartSupervisor<L> {
    lifecycle: L,
}

impl<L: Lifecycle> RestartSupervisor<L> {
    pub fn new(lifecycle: L) -> Self {
        Self { lifecycle }
    }

    pub fn lifecycle(&self) -> &L {
        &self.lifecycle
    }

    /// Execute exactly one lifecycle.
    pub async fn run_once(&self, scope: &LifecycleScope) -> Result<(), RunError> {
        self.lifecycle.run_once(scope).await
    }

    /// Execute one lifecycle. Returns `Ok` when the scope was cancelled so
    /// the caller may start a fresh one; other errors are returned unchanged.
    pub async fn run_supervised(&self, scope: &LifecycleScope) -> Result<(), RunError> {
        let result = self.run_once(scope).await;
        match classify(result, scope) {
            RestartDecision::Restart => {
                if scope.is_cancelled() {
                    info!("Restarting: kube-state-metrics, metrics will be reset");
                }
                Ok(())
            }
            RestartDecision::Fatal(e) => Err(e),
        }
    }

    /// Run lifecycles back to back while `control` keeps asking for reloads.
    ///
    /// Returns once termination was requested, even if it arrived while a
    /// reloading lifecycle was still shutting down, or when a lifecycle ends
    /// without being cancelled.
    pub async fn run_until_terminated(&self, control: &LifecycleControl) -> Result<(), RunError> {
        while let Some(scope) = control.next_scope() {
            self.run_supervised(&scope).await?;
            if control.is_terminated() || scope.reason() != Some(CancelReason::Reload) {
                break;
            }
            info!("Reloading kube-state-metrics");
        }
        Ok(())
    }
}
