// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One lifecycle of the exporter.
//!
//! Every lifecycle starts from scratch: fresh self metrics, configuration
//! read again from disk, a new store builder and new listeners. It ends when
//! the first of its actors stops, which in normal operation is the scope
//! being cancelled for a reload or termination.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_yaml::Value;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::actor_group::ActorGroup;
use crate::config_gate::{ConfigReloadGate, CUSTOM_RESOURCE_CONFIG_TYPE, OPTIONS_CONFIG_TYPE};
use crate::discovery::{Discoverer, DiscoveryPollingActor, KubeConfig, PollContext};
use crate::error::RunError;
use crate::http::{healthz, metrics_response, LandingLink, LandingPage, Router, HEALTHZ_PATH, METRICS_PATH};
use crate::options::Options;
use crate::scope::LifecycleScope;
use crate::service::{HttpServer, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::store::{
    merge_field_selectors, parse_allow_list, GenerateStoresFn, MetricFamilyFilter, MetricsHandler,
    MetricsPipeline, StoreBuilder, DEFAULT_RESOURCES,
};
use crate::supervisor::Lifecycle;
use crate::telemetry::SelfMetrics;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Addresses the servers of the running lifecycle listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddrs {
    pub metrics: SocketAddr,
    pub telemetry: SocketAddr,
}

/// The kube-state-metrics exporter, assembled anew on every lifecycle.
pub struct KubeStateMetrics {
    options: Options,
    discoverer: Option<Arc<dyn Discoverer>>,
    generate_stores: Option<GenerateStoresFn>,
    shutdown_timeout: Duration,
    bound: watch::Sender<Option<BoundAddrs>>,
}

impl KubeStateMetrics {
    pub fn new(options: Options) -> Self {
        let (bound, _) = watch::channel(None);
        Self {
            options,
            discoverer: None,
            generate_stores: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            bound,
        }
    }

    /// Discoverer used when a custom resource state config is set.
    pub fn with_discoverer(mut self, discoverer: Arc<dyn Discoverer>) -> Self {
        self.discoverer = Some(discoverer);
        self
    }

    pub fn with_generate_stores_func(mut self, generate: GenerateStoresFn) -> Self {
        self.generate_stores = Some(generate);
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Watch the addresses bound by each lifecycle.
    pub fn subscribe_bound(&self) -> watch::Receiver<Option<BoundAddrs>> {
        self.bound.subscribe()
    }

    async fn load_options(&self, gate: &ConfigReloadGate, scope: &LifecycleScope) -> Result<Options, RunError> {
        let Some(path) = self.options.config_file() else {
            return Ok(self.options.clone());
        };

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| RunError::ReadConfig {
                path: path.clone(),
                source,
            })?;
        let filename = clean_path(&path);
        let options = gate
            .apply(&self.options, OPTIONS_CONFIG_TYPE, &filename, &bytes, scope.token())
            .await?;
        info!("Loaded options config file {}", filename);
        Ok(options)
    }

    fn store_builder(&self, options: &Options) -> Result<StoreBuilder, RunError> {
        let mut builder = StoreBuilder::new();

        let resources: Vec<String> = if options.resources.is_empty() && !options.custom_resources_only {
            info!("Using default resources");
            DEFAULT_RESOURCES.iter().map(|r| r.to_string()).collect()
        } else if options.custom_resources_only {
            info!("Using custom resources only");
            Vec::new()
        } else {
            options.resources.clone()
        };
        builder.with_enabled_resources(&resources)?;
        info!("Used resources: {}", builder.enabled_resources().join(","));

        let namespaces = options.watched_namespaces();
        if namespaces.is_empty() {
            info!("Using all namespaces");
        } else {
            info!("Using namespaces {}", namespaces.join(","));
        }
        builder.with_namespaces(namespaces);

        let field_selector =
            merge_field_selectors(&[options.namespace_field_selector(), options.node_field_selector()])?;
        debug!("Using field selector {:?}", field_selector);
        builder.with_field_selector_filter(field_selector);

        builder.with_family_filter(MetricFamilyFilter::new(
            &options.metric_allowlist,
            &options.metric_denylist,
            &options.metric_opt_in_list,
        )?);
        builder.with_using_apiserver_cache(options.use_apiserver_cache);
        builder.with_sharding(options.shard, options.total_shards)?;
        builder.with_allow_labels(parse_allow_list(&options.labels_allow_list)?);
        builder.with_allow_annotations(parse_allow_list(&options.annotations_allow_list)?);

        if let Some(generate) = &self.generate_stores {
            let generate = Arc::clone(generate);
            builder.with_generate_stores_func(move |builder| generate(builder));
        }

        Ok(builder)
    }

    async fn bind(&self, name: &str, host: &str, port: u16, router: Router) -> Result<HttpServer, RunError> {
        let addr = resolve(host, port).await?;
        Ok(HttpServer::bind(name, addr, router)
            .await?
            .with_shutdown_timeout(self.shutdown_timeout))
    }
}

#[async_trait]
impl Lifecycle for KubeStateMetrics {
    async fn run_once(&self, scope: &LifecycleScope) -> Result<(), RunError> {
        info!("Starting kube-state-metrics version {}", VERSION);

        let metrics = Arc::new(SelfMetrics::new(VERSION));
        let gate = ConfigReloadGate::new(Arc::clone(&metrics));

        let options = self.load_options(&gate, scope).await?;
        options.validate()?;

        let custom_resource_config = resolve_custom_resource_config(&options, &gate).await?;
        let store_builder = Arc::new(self.store_builder(&options)?);
        let handler = Arc::new(MetricsHandler::new(Arc::clone(&store_builder)));

        let mut group = ActorGroup::new();

        match custom_resource_config {
            None => {
                let token = scope.child_token();
                let pipeline = Arc::clone(&handler);
                group.add_cancellable("metrics-handler", token.clone(), async move {
                    pipeline.run(token).await
                });
            }
            Some(custom_resource_config) => {
                let discoverer = self
                    .discoverer
                    .clone()
                    .ok_or(RunError::DiscoveryUnavailable)?;
                let ctx = PollContext {
                    options: Arc::new(options.clone()),
                    store_builder: Arc::clone(&store_builder),
                    handler: Arc::clone(&handler),
                    custom_resource_config,
                    metrics: Arc::clone(&metrics),
                };
                DiscoveryPollingActor::new(discoverer, KubeConfig::from(&options), ctx)
                    .register(&mut group, scope.token());
            }
        }

        let telemetry = self
            .bind(
                "telemetry",
                &options.telemetry_host,
                options.telemetry_port,
                telemetry_router(&metrics),
            )
            .await?;
        let server = self
            .bind(
                "metrics",
                &options.host,
                options.port,
                metrics_router(&metrics, handler),
            )
            .await?;
        self.bound.send_replace(Some(BoundAddrs {
            metrics: server.local_addr(),
            telemetry: telemetry.local_addr(),
        }));

        telemetry.register(&mut group, scope.child_token());
        server.register(&mut group, scope.child_token());

        let result = group.start().await;
        self.bound.send_replace(None);
        result?;
        Ok(())
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, RunError> {
    let invalid = |reason: String| RunError::InvalidConfig(format!("invalid listen address {host}:{port}: {reason}"));
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("no address found".to_string()))
}

/// Lexically normalised form of `path`, used as the `filename` label.
///
/// Repeated separators and `.` are dropped and `..` is resolved against the
/// preceding component. An empty result is `.`.
fn clean_path(path: &Path) -> String {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match clean.components().next_back() {
                Some(Component::Normal(_)) => {
                    clean.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => clean.push(".."),
            },
            other => clean.push(other.as_os_str()),
        }
    }
    if clean.as_os_str().is_empty() {
        ".".to_string()
    } else {
        clean.display().to_string()
    }
}

/// Inline config takes precedence over the config file.
async fn resolve_custom_resource_config(
    options: &Options,
    gate: &ConfigReloadGate,
) -> Result<Option<Value>, RunError> {
    if let Some(inline) = options.custom_resource_config.as_deref().filter(|c| !c.is_empty()) {
        return decode_custom_resource_config(inline.as_bytes(), "inline").map(Some);
    }

    let Some(path) = options
        .custom_resource_config_file
        .as_deref()
        .filter(|p| !p.as_os_str().is_empty())
    else {
        return Ok(None);
    };

    let bytes = read_custom_resource_config(path).await?;
    let filename = clean_path(path);
    let config = decode_custom_resource_config(&bytes, &filename)?;
    gate.mark_loaded(CUSTOM_RESOURCE_CONFIG_TYPE, &filename, &bytes);
    info!("Loaded custom resource state config file {}", filename);
    Ok(Some(config))
}

async fn read_custom_resource_config(path: &Path) -> Result<Vec<u8>, RunError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| RunError::CustomResourceConfig(format!("{}: {e}", path.display())))
}

fn decode_custom_resource_config(bytes: &[u8], source: &str) -> Result<Value, RunError> {
    serde_yaml::from_slice(bytes)
        .map_err(|e| RunError::CustomResourceConfig(format!("parsing {source} config failed: {e}")))
}

fn telemetry_router(metrics: &Arc<SelfMetrics>) -> Router {
    let page = LandingPage {
        name: "kube-state-metrics",
        description: "Self-metrics for kube-state-metrics",
        version: VERSION.to_string(),
        links: vec![LandingLink {
            address: METRICS_PATH,
            text: "Metrics",
        }],
    };
    let metrics = Arc::clone(metrics);
    Router::new()
        .route(METRICS_PATH, move |_| {
            let body = metrics.render();
            async move { metrics_response(body) }
        })
        .route("/", move |_| {
            let response = page.response();
            async move { response }
        })
}

fn metrics_router(metrics: &Arc<SelfMetrics>, pipeline: Arc<dyn MetricsPipeline>) -> Router {
    let page = LandingPage {
        name: "kube-state-metrics",
        description: "Metrics for Kubernetes' state",
        version: VERSION.to_string(),
        links: vec![
            LandingLink {
                address: METRICS_PATH,
                text: "Metrics",
            },
            LandingLink {
                address: HEALTHZ_PATH,
                text: "Healthz",
            },
        ],
    };
    let metrics = Arc::clone(metrics);
    Router::new()
        .route(METRICS_PATH, move |req| {
            let started = Instant::now();
            let mut body = String::new();
            pipeline.write_metrics(&mut body);
            metrics.observe_request(req.method().as_str(), started.elapsed());
            async move { metrics_response(body) }
        })
        .route(HEALTHZ_PATH, |_| async { healthz() })
        .route("/", move |_| {
            let response = page.response();
            async move { response }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::CancelReason;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::time::timeout;

    fn local_options() -> Options {
        Options {
            host: "127.0.0.1".to_string(),
            port: 0,
            telemetry_host: "127.0.0.1".to_string(),
            telemetry_port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_resources_selected() {
        let ksm = KubeStateMetrics::new(Options::default());
        let builder = ksm.store_builder(&Options::default()).unwrap();
        assert_eq!(builder.enabled_resources().len(), DEFAULT_RESOURCES.len());
    }

    #[test]
    fn test_custom_resources_only_selects_nothing() {
        let options = Options {
            custom_resources_only: true,
            resources: vec!["pods".to_string()],
            ..Default::default()
        };
        let builder = KubeStateMetrics::new(options.clone())
            .store_builder(&options)
            .unwrap();
        assert!(builder.enabled_resources().is_empty());
    }

    #[test]
    fn test_store_builder_setup_errors_are_fatal() {
        let options = Options {
            labels_allow_list: "pods=app".to_string(),
            ..Default::default()
        };
        let result = KubeStateMetrics::new(options.clone()).store_builder(&options);
        assert!(matches!(result, Err(RunError::Setup(_))));
    }

    #[tokio::test]
    async fn test_inline_custom_resource_config_wins() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "spec: {{resources: [file]}}").unwrap();
        let options = Options {
            custom_resource_config: Some("spec: {resources: [inline]}".to_string()),
            custom_resource_config_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let metrics = Arc::new(SelfMetrics::default());
        let gate = ConfigReloadGate::new(Arc::clone(&metrics));

        let config = resolve_custom_resource_config(&options, &gate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(config["spec"]["resources"][0], Value::from("inline"));
        assert!(metrics
            .reload_state(CUSTOM_RESOURCE_CONFIG_TYPE, &file.path().display().to_string())
            .is_none());
    }

    #[tokio::test]
    async fn test_custom_resource_config_file_records_reload_state() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "spec: {{resources: [file]}}").unwrap();
        let options = Options {
            custom_resource_config_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let metrics = Arc::new(SelfMetrics::default());
        let gate = ConfigReloadGate::new(Arc::clone(&metrics));

        let config = resolve_custom_resource_config(&options, &gate)
            .await
            .unwrap();
        assert!(config.is_some());
        let state = metrics
            .reload_state(CUSTOM_RESOURCE_CONFIG_TYPE, &file.path().display().to_string())
            .unwrap();
        assert!(state.success);
        assert!(state.hash.is_some());
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(Path::new("./cfg.yaml")), "cfg.yaml");
        assert_eq!(clean_path(Path::new("//etc/ksm//cfg.yaml")), "/etc/ksm/cfg.yaml");
        assert_eq!(clean_path(Path::new("/etc/ksm/../cfg.yaml")), "/etc/cfg.yaml");
        assert_eq!(clean_path(Path::new("../x/./y.yaml")), "../x/y.yaml");
        assert_eq!(clean_path(Path::new("/../cfg.yaml")), "/cfg.yaml");
        assert_eq!(clean_path(Path::new("a/..")), ".");
    }

    #[tokio::test]
    async fn test_reload_state_uses_clean_filename() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "spec: {{resources: [file]}}").unwrap();
        let dir = file.path().parent().unwrap();
        let name = file.path().file_name().unwrap().to_str().unwrap();
        let options = Options {
            custom_resource_config_file: Some(format!("{}/.//{name}", dir.display()).into()),
            ..Default::default()
        };
        let metrics = Arc::new(SelfMetrics::default());
        let gate = ConfigReloadGate::new(Arc::clone(&metrics));

        resolve_custom_resource_config(&options, &gate).await.unwrap();
        assert!(metrics
            .reload_state(CUSTOM_RESOURCE_CONFIG_TYPE, &file.path().display().to_string())
            .is_some());
    }

    #[tokio::test]
    async fn test_missing_custom_resource_config_file_is_fatal() {
        let options = Options {
            custom_resource_config_file: Some("/nonexistent/crs.yaml".into()),
            ..Default::default()
        };
        let gate = ConfigReloadGate::new(Arc::new(SelfMetrics::default()));
        let result = resolve_custom_resource_config(&options, &gate).await;
        assert!(matches!(result, Err(RunError::CustomResourceConfig(_))));
    }

    #[tokio::test]
    async fn test_missing_options_config_file_is_fatal() {
        let options = Options {
            config: Some("/nonexistent/config.yaml".into()),
            ..local_options()
        };
        let ksm = KubeStateMetrics::new(options);
        let result = ksm.run_once(&LifecycleScope::new()).await;
        assert!(matches!(result, Err(RunError::ReadConfig { .. })));
    }

    #[tokio::test]
    async fn test_custom_resource_config_without_discoverer_fails() {
        let options = Options {
            custom_resource_config: Some("spec: {}".to_string()),
            ..local_options()
        };
        let ksm = KubeStateMetrics::new(options);
        let result = ksm.run_once(&LifecycleScope::new()).await;
        assert!(matches!(result, Err(RunError::DiscoveryUnavailable)));
    }

    #[tokio::test]
    async fn test_lifecycle_stops_on_cancellation() {
        let ksm = KubeStateMetrics::new(local_options()).with_shutdown_timeout(Duration::from_millis(200));
        let mut bound = ksm.subscribe_bound();
        let scope = LifecycleScope::new();

        let run = ksm.run_once(&scope);
        tokio::pin!(run);
        let addrs = tokio::select! {
            res = &mut run => panic!("lifecycle returned early: {res:?}"),
            addrs = bound.wait_for(Option::is_some) => addrs.unwrap().unwrap(),
        };
        assert_ne!(addrs.metrics.port(), 0);
        assert_ne!(addrs.telemetry.port(), 0);

        scope.cancel(CancelReason::Terminate);
        let result = timeout(Duration::from_secs(2), run).await.unwrap();
        assert!(result.is_ok());
    }
}
