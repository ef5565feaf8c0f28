// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime supervisor of the kube-state-metrics exporter.
//!
//! One lifecycle runs a fixed set of actors (metrics collection or custom
//! resource discovery, the telemetry server and the metrics server) in an
//! [`ActorGroup`](actor_group::ActorGroup). The first actor to stop tears the
//! others down. A lifecycle cancelled through its [`LifecycleScope`] is a
//! restart, any other failure is fatal; see [`supervisor`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod actor_group;
pub mod config_gate;
pub mod discovery;
pub mod error;
pub mod http;
pub mod options;
pub mod scope;
pub mod server;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod telemetry;

pub use actor_group::ActorGroup;
pub use error::{BoxError, GroupError, RunError};
pub use options::Options;
pub use scope::{CancelReason, LifecycleControl, LifecycleScope};
pub use server::KubeStateMetrics;
pub use supervisor::{Lifecycle, RestartSupervisor};
