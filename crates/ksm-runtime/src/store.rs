// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Store/collection seam.
//!
//! The collection layer itself (listers, watchers and metric generators per
//! resource) is pluggable: a [`StoreBuilder`] collects the exporter settings
//! and hands them to a generate-stores function, and the [`MetricsHandler`]
//! serves whatever stores that function produced.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{BoxError, StoreError};

/// Resources enabled when none are requested explicitly.
pub const DEFAULT_RESOURCES: [&str; 27] = [
    "certificatesigningrequests",
    "configmaps",
    "cronjobs",
    "daemonsets",
    "deployments",
    "endpoints",
    "horizontalpodautoscalers",
    "ingresses",
    "jobs",
    "leases",
    "limitranges",
    "mutatingwebhookconfigurations",
    "namespaces",
    "networkpolicies",
    "nodes",
    "persistentvolumeclaims",
    "persistentvolumes",
    "poddisruptionbudgets",
    "pods",
    "replicasets",
    "replicationcontrollers",
    "resourcequotas",
    "secrets",
    "services",
    "statefulsets",
    "storageclasses",
    "validatingwebhookconfigurations",
];

/// Resources that can be enabled but are off by default.
const OPTIONAL_RESOURCES: [&str; 3] = ["endpointslices", "ingressclasses", "volumeattachments"];

/// Label or annotation keys exposed per resource. `*` allows every key.
pub type AllowList = BTreeMap<String, Vec<String>>;

/// A source of metric families, written in the Prometheus text format.
pub trait MetricStore: Send + Sync {
    fn write_all(&self, out: &mut String);
}

/// Produces the stores of a configured builder.
pub type GenerateStoresFn = Arc<dyn Fn(&StoreBuilder) -> Vec<Arc<dyn MetricStore>> + Send + Sync>;

/// Which metric families are exposed.
#[derive(Debug, Clone, Default)]
pub struct MetricFamilyFilter {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
    opt_in: Vec<Regex>,
}

impl MetricFamilyFilter {
    /// Build a filter from allow/deny patterns and the opted-in experimental
    /// families. Patterns match whole family names. Only one of the allow
    /// and deny lists may be set.
    pub fn new(allow: &[String], deny: &[String], opt_in: &[String]) -> Result<Self, StoreError> {
        let allow = compile(allow)?;
        let deny = compile(deny)?;
        if !allow.is_empty() && !deny.is_empty() {
            return Err(StoreError::AllowDenyConflict);
        }
        Ok(Self {
            allow,
            deny,
            opt_in: compile(opt_in)?,
        })
    }

    pub fn is_included(&self, family: &str) -> bool {
        if !self.allow.is_empty() {
            return self.allow.iter().any(|re| re.is_match(family));
        }
        !self.deny.iter().any(|re| re.is_match(family))
    }

    pub fn is_opted_in(&self, family: &str) -> bool {
        self.opt_in.iter().any(|re| re.is_match(family))
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, StoreError> {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|pattern| {
            Regex::new(&format!("^(?:{pattern})$")).map_err(|source| StoreError::MetricPattern {
                pattern: pattern.to_string(),
                source,
            })
        })
        .collect()
}

/// Parse `resource=[name,...],resource=[*]` into an [`AllowList`].
pub fn parse_allow_list(input: &str) -> Result<AllowList, StoreError> {
    let invalid = || StoreError::AllowList(input.to_string());
    let mut allow_list = AllowList::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let (resource, tail) = rest.split_once('=').ok_or_else(invalid)?;
        let resource = resource.trim();
        if resource.is_empty() {
            return Err(invalid());
        }
        let tail = tail.trim_start().strip_prefix('[').ok_or_else(invalid)?;
        let (names, tail) = tail.split_once(']').ok_or_else(invalid)?;

        let names = names
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        allow_list.insert(resource.to_string(), names);

        let tail = tail.trim_start();
        rest = match tail.strip_prefix(',') {
            Some(next) => next.trim_start(),
            None if tail.is_empty() => tail,
            None => return Err(invalid()),
        };
    }

    Ok(allow_list)
}

/// Merge field selectors into one, dropping empty and duplicate terms.
pub fn merge_field_selectors<S: AsRef<str>>(selectors: &[S]) -> Result<String, StoreError> {
    let mut seen = BTreeSet::new();
    let mut terms = Vec::new();

    for selector in selectors {
        for term in selector.as_ref().split(',').map(str::trim) {
            if term.is_empty() {
                continue;
            }
            validate_selector_term(term)?;
            if seen.insert(term.to_string()) {
                terms.push(term);
            }
        }
    }

    Ok(terms.join(","))
}

fn validate_selector_term(term: &str) -> Result<(), StoreError> {
    let key = term
        .split_once("!=")
        .or_else(|| term.split_once("=="))
        .or_else(|| term.split_once('='))
        .map(|(key, _)| key.trim());

    match key {
        Some(key) if !key.is_empty() => Ok(()),
        _ => Err(StoreError::FieldSelector {
            selector: term.to_string(),
            reason: "expected key=value, key==value or key!=value".to_string(),
        }),
    }
}

/// Exporter settings handed to the generate-stores function.
#[derive(Clone)]
pub struct StoreBuilder {
    enabled_resources: Vec<String>,
    namespaces: Vec<String>,
    field_selector_filter: String,
    family_filter: MetricFamilyFilter,
    use_apiserver_cache: bool,
    shard: u32,
    total_shards: u32,
    allow_labels: AllowList,
    allow_annotations: AllowList,
    generate_stores: Option<GenerateStoresFn>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self {
            enabled_resources: Vec::new(),
            namespaces: Vec::new(),
            field_selector_filter: String::new(),
            family_filter: MetricFamilyFilter::default(),
            use_apiserver_cache: false,
            shard: 0,
            total_shards: 1,
            allow_labels: AllowList::new(),
            allow_annotations: AllowList::new(),
            generate_stores: None,
        }
    }
}

impl fmt::Debug for StoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("enabled_resources", &self.enabled_resources)
            .field("namespaces", &self.namespaces)
            .field("field_selector_filter", &self.field_selector_filter)
            .field("use_apiserver_cache", &self.use_apiserver_cache)
            .field("shard", &self.shard)
            .field("total_shards", &self.total_shards)
            .finish_non_exhaustive()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable `resources`. Unknown resource names are rejected.
    pub fn with_enabled_resources<S: AsRef<str>>(&mut self, resources: &[S]) -> Result<(), StoreError> {
        let mut enabled = BTreeSet::new();
        for resource in resources {
            let resource = resource.as_ref().trim();
            if !is_known_resource(resource) {
                let mut available: Vec<_> = DEFAULT_RESOURCES
                    .iter()
                    .chain(OPTIONAL_RESOURCES.iter())
                    .copied()
                    .collect();
                available.sort_unstable();
                return Err(StoreError::UnknownResource(
                    resource.to_string(),
                    available.join(","),
                ));
            }
            enabled.insert(resource.to_string());
        }
        self.enabled_resources = enabled.into_iter().collect();
        Ok(())
    }

    pub fn enabled_resources(&self) -> &[String] {
        &self.enabled_resources
    }

    /// Watch `namespaces`. An empty list watches every namespace.
    pub fn with_namespaces(&mut self, namespaces: Vec<String>) {
        self.namespaces = namespaces;
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    pub fn with_field_selector_filter(&mut self, selector: String) {
        self.field_selector_filter = selector;
    }

    pub fn field_selector_filter(&self) -> &str {
        &self.field_selector_filter
    }

    pub fn with_family_filter(&mut self, filter: MetricFamilyFilter) {
        self.family_filter = filter;
    }

    pub fn family_filter(&self) -> &MetricFamilyFilter {
        &self.family_filter
    }

    pub fn with_using_apiserver_cache(&mut self, use_apiserver_cache: bool) {
        self.use_apiserver_cache = use_apiserver_cache;
    }

    pub fn use_apiserver_cache(&self) -> bool {
        self.use_apiserver_cache
    }

    pub fn with_sharding(&mut self, shard: u32, total_shards: u32) -> Result<(), StoreError> {
        if total_shards == 0 || shard >= total_shards {
            return Err(StoreError::Sharding {
                shard,
                total: total_shards,
            });
        }
        self.shard = shard;
        self.total_shards = total_shards;
        Ok(())
    }

    pub fn sharding(&self) -> (u32, u32) {
        (self.shard, self.total_shards)
    }

    pub fn with_allow_labels(&mut self, allow_labels: AllowList) {
        self.allow_labels = allow_labels;
    }

    pub fn allow_labels(&self) -> &AllowList {
        &self.allow_labels
    }

    pub fn with_allow_annotations(&mut self, allow_annotations: AllowList) {
        self.allow_annotations = allow_annotations;
    }

    pub fn allow_annotations(&self) -> &AllowList {
        &self.allow_annotations
    }

    pub fn with_generate_stores_func<F>(&mut self, generate: F)
    where
        F: Fn(&StoreBuilder) -> Vec<Arc<dyn MetricStore>> + Send + Sync + 'static,
    {
        self.generate_stores = Some(Arc::new(generate));
    }

    /// Generate the stores for the current settings.
    pub fn build(&self) -> Vec<Arc<dyn MetricStore>> {
        match &self.generate_stores {
            Some(generate) => generate(self),
            None => {
                debug!("No generate-stores function configured, serving no stores");
                Vec::new()
            }
        }
    }
}

fn is_known_resource(resource: &str) -> bool {
    DEFAULT_RESOURCES.contains(&resource) || OPTIONAL_RESOURCES.contains(&resource)
}

/// Metrics collection pipeline, run as an actor of the lifecycle.
#[async_trait]
pub trait MetricsPipeline: Send + Sync {
    /// Collect until `token` is cancelled.
    async fn run(&self, token: CancellationToken) -> Result<(), BoxError>;

    /// Append the current metrics in the Prometheus text format.
    fn write_metrics(&self, out: &mut String);
}

/// Serves the stores generated by a [`StoreBuilder`].
pub struct MetricsHandler {
    builder: Arc<StoreBuilder>,
    stores: RwLock<Vec<Arc<dyn MetricStore>>>,
}

impl MetricsHandler {
    pub fn new(builder: Arc<StoreBuilder>) -> Self {
        Self {
            builder,
            stores: RwLock::new(Vec::new()),
        }
    }

    pub fn builder(&self) -> &Arc<StoreBuilder> {
        &self.builder
    }

    /// Replace the served stores, e.g. after a discovery cache refresh.
    pub fn set_stores(&self, stores: Vec<Arc<dyn MetricStore>>) {
        *self.stores.write() = stores;
    }

    pub fn store_count(&self) -> usize {
        self.stores.read().len()
    }
}

#[async_trait]
impl MetricsPipeline for MetricsHandler {
    async fn run(&self, token: CancellationToken) -> Result<(), BoxError> {
        let stores = self.builder.build();
        info!(
            "Serving {} metric stores for resources {}",
            stores.len(),
            self.builder.enabled_resources().join(",")
        );
        self.set_stores(stores);

        token.cancelled().await;

        self.stores.write().clear();
        debug!("Metrics handler stopped");
        Ok(())
    }

    fn write_metrics(&self, out: &mut String) {
        for store in self.stores.read().iter() {
            store.write_all(out);
        }
    }
}
