// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared cancellation scope for one exporter lifecycle.
//!
//! A scope wraps a [`CancellationToken`] together with the reason it was
//! cancelled for. Actors only ever see child tokens; the reason is read at the
//! process boundary to decide between starting a fresh lifecycle and exiting.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Why a lifecycle scope was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Tear everything down and start a fresh lifecycle (e.g. SIGHUP after a
    /// configuration change).
    Reload,
    /// Tear everything down and exit (e.g. SIGTERM or Ctrl+C).
    Terminate,
}

/// Cancellation signal shared by every actor of a lifecycle.
///
/// Cloning is cheap; all clones observe the same cancellation. A scope cannot
/// be reset: a new lifecycle needs a new scope.
#[derive(Debug, Clone, Default)]
pub struct LifecycleScope {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl LifecycleScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the scope. Only the first reason is kept.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason of the cancellation, `None` while the scope is live.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Completes once the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Token cancelled with this scope, which can also be cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// The underlying token, for collaborators that only need to observe it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Routes cancellation requests to whichever lifecycle scope is current.
///
/// Signal listeners outlive every scope, so a request that arrives while a
/// lifecycle drains or before the next one starts is not lost. `Terminate`
/// is latched: once received, no further scope is handed out.
#[derive(Debug, Clone, Default)]
pub struct LifecycleControl {
    state: Arc<Mutex<ControlState>>,
}

#[derive(Debug, Default)]
struct ControlState {
    current: Option<LifecycleScope>,
    terminated: bool,
}

impl LifecycleControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope for the next lifecycle, `None` once termination was requested.
    pub fn next_scope(&self) -> Option<LifecycleScope> {
        let mut state = self.state.lock();
        if state.terminated {
            return None;
        }
        let scope = LifecycleScope::new();
        state.current = Some(scope.clone());
        Some(scope)
    }

    /// Cancel the current scope.
    pub fn cancel(&self, reason: CancelReason) {
        let mut state = self.state.lock();
        if reason == CancelReason::Terminate {
            state.terminated = true;
        }
        if let Some(scope) = &state.current {
            scope.cancel(reason);
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }
}
