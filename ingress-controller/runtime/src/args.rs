use crate::{
    core::{annotations, ResourceId},
    grpc::{self, Reload},
    index::{self, Index},
    k8s, FileReload, ReconcileMetrics, Reconciler,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

/// The number of envelopes buffered in front of the data-plane stream.
const STREAM_BUFFER: usize = 16;

#[derive(Debug, Parser)]
#[clap(name = "ingress", about = "An ingress controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "ingress=info,warn",
        env = "INGRESS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The ingress class this controller serves.
    #[clap(long, default_value = "nginx")]
    ingress_class: String,

    /// Also serve Ingresses that name no class.
    #[clap(long)]
    watch_ingress_without_class: bool,

    /// Restricts watches to a single namespace.
    #[clap(long)]
    watch_namespace: Option<String>,

    /// The `namespace/name` of a ConfigMap holding operator-wide annotation defaults.
    #[clap(long)]
    configmap: Option<ConfigMapRef>,

    #[clap(long, default_value = annotations::DEFAULT_PREFIX)]
    annotations_prefix: String,

    /// Whether annotations that cross trust boundaries (external auth, raw snippets, source
    /// allowlists) are honored.
    #[clap(long, default_value = "true", action = clap::ArgAction::Set)]
    allow_critical_annotations: bool,

    /// The gRPC endpoint of the data-plane worker.
    #[clap(long)]
    dataplane_addr: String,

    #[clap(long, default_value = "ingress-controller", env = "HOSTNAME")]
    worker_name: String,

    #[clap(long, default_value = "5000")]
    send_timeout_ms: u64,

    #[clap(long, default_value = "3000")]
    connect_timeout_ms: u64,

    #[clap(long, default_value = "500")]
    backoff_min_ms: u64,

    #[clap(long, default_value = "30000")]
    backoff_max_ms: u64,

    /// How long an update may stay undelivered before the configuration is reloaded locally.
    #[clap(long, default_value = "60")]
    max_staleness_secs: u64,

    #[clap(long, default_value = "3")]
    max_auth_failures: u32,

    #[clap(long, default_value = "30")]
    reset_cool_down_secs: u64,

    /// Writes every fully reloaded configuration to this file.
    #[clap(long)]
    reload_path: Option<PathBuf>,

    #[clap(long, default_value = "10")]
    reconcile_period_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            ingress_class,
            watch_ingress_without_class,
            watch_namespace,
            configmap,
            annotations_prefix,
            allow_critical_annotations,
            dataplane_addr,
            worker_name,
            send_timeout_ms,
            connect_timeout_ms,
            backoff_min_ms,
            backoff_max_ms,
            max_staleness_secs,
            max_auth_failures,
            reset_cool_down_secs,
            reload_path,
            reconcile_period_secs,
        } = self;

        if backoff_min_ms == 0 || backoff_min_ms > backoff_max_ms {
            bail!("--backoff-min-ms must be positive and no greater than --backoff-max-ms");
        }

        let registry = annotations::Registry::standard(&annotations_prefix)
            .context("invalid annotation table")?
            .allow_critical(allow_critical_annotations);
        if !allow_critical_annotations {
            info!("Critical annotations are disabled");
        }

        let class = k8s::IngressClass::new(ingress_class)
            .watch_without_class(watch_ingress_without_class);
        let settings = configmap.map(|ConfigMapRef(id)| id);
        let (index, changes) = Index::shared(class, Arc::new(registry), settings.clone());

        let mut prom = <Registry>::default();
        index::metrics::register(prom.sub_registry_with_prefix("ingress_index"), index.clone());
        let distributor_metrics =
            grpc::DistributorMetrics::register(prom.sub_registry_with_prefix("distributor"));
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Spawn resource watches.

        let watches = match watch_namespace.as_deref() {
            Some(ns) => watcher::Config::default().fields(&format!("metadata.namespace={ns}")),
            None => watcher::Config::default(),
        };

        let ingresses = runtime.watch_all::<k8s::Ingress>(watches.clone());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), ingresses).instrument(info_span!("ingresses")),
        );

        let services = runtime.watch_all::<k8s::Service>(watches.clone());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), services).instrument(info_span!("services")),
        );

        let slices = runtime.watch_all::<k8s::EndpointSlice>(watches.clone());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), slices)
                .instrument(info_span!("endpointslices")),
        );

        let secrets = runtime.watch_all::<k8s::Secret>(watches);
        tokio::spawn(
            kubert::index::namespaced(index.clone(), secrets).instrument(info_span!("secrets")),
        );

        if let Some(ResourceId { namespace, name }) = settings {
            let configmaps = runtime.watch_all::<k8s::ConfigMap>(watcher::Config::default().fields(
                &format!("metadata.namespace={namespace},metadata.name={name}"),
            ));
            tokio::spawn(
                kubert::index::namespaced(index.clone(), configmaps)
                    .instrument(info_span!("configmaps")),
            );
        }

        // Spawn the distributor and the control loop that feeds it.

        let reload: Arc<dyn Reload> = match reload_path {
            Some(path) => {
                info!(path = %path.display(), "Writing reloaded configurations");
                Arc::new(FileReload::new(path))
            }
            None => Arc::new(grpc::NoReload),
        };

        let connector = grpc::GrpcConnector::new(
            dataplane_addr.clone(),
            &worker_name,
            Duration::from_millis(connect_timeout_ms),
        )?;
        let (distributor, errors) = grpc::Distributor::spawn(
            grpc::Config {
                worker: worker_name,
                connect_timeout: Duration::from_millis(connect_timeout_ms),
                send_timeout: Duration::from_millis(send_timeout_ms),
                backoff: grpc::Backoff {
                    min: Duration::from_millis(backoff_min_ms),
                    max: Duration::from_millis(backoff_max_ms),
                },
                max_staleness: Duration::from_secs(max_staleness_secs),
                max_auth_failures,
                buffer: STREAM_BUFFER,
            },
            connector,
            reload.clone(),
            distributor_metrics,
            runtime.shutdown_handle(),
        );
        info!(addr = %dataplane_addr, "Distributing configurations");

        let reconciler = Reconciler::new(
            index,
            changes,
            distributor,
            errors,
            reload,
            reconcile_metrics,
        )
        .with_period(Duration::from_secs(reconcile_period_secs))
        .with_reset_cool_down(Duration::from_secs(reset_cool_down_secs));
        tokio::spawn(
            reconciler
                .run(runtime.shutdown_handle())
                .instrument(info_span!("reconcile")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Names the settings ConfigMap as `namespace/name`.
#[derive(Clone, Debug)]
struct ConfigMapRef(ResourceId);

impl std::str::FromStr for ConfigMapRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self(ResourceId::new(ns, name)))
            }
            _ => bail!("expected namespace/name; got {s:?}"),
        }
    }
}
