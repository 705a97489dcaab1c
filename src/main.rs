use async_trait::async_trait;
use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube_informer::config::{ControllerConfig, DEFAULT_WORKERS};
use kube_informer::controller::{Controller, Reconciler};
use kube_informer::error::Result;
use kube_informer::informer::SharedInformerFactory;
use kube_informer::k8s::{USER_AGENT, client};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const NODE_INDEX: &str = "node";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace to watch
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// Only watch pods matching this label selector
    #[arg(short = 'l', long)]
    selector: Option<String>,

    /// Resync period in seconds, 0 disables resync
    #[arg(long, default_value_t = 0)]
    resync_seconds: u64,

    /// Number of reconcile workers
    #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Give up on a pod after this many failed reconciles
    #[arg(long)]
    max_retries: Option<u32>,

    /// Seconds to wait for the initial list before carrying on anyway
    #[arg(long, default_value_t = 30)]
    sync_timeout_seconds: u64,
}

fn init_tracing() {
    let env = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

struct LogPods;

#[async_trait]
impl Reconciler<Pod> for LogPods {
    async fn reconcile(&self, key: &str, pod: Option<Arc<Pod>>) -> anyhow::Result<()> {
        let Some(pod) = pod else {
            info!("🗑️  {} is gone", key);
            return Ok(());
        };
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or("<unscheduled>");
        info!("📦 {} is {} on {} ({} labels)", key, phase, node, pod.labels().len());
        Ok(())
    }
}

fn node_of(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .into_iter()
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    init_tracing();
    let args = Args::parse();

    let client = client::new(Some(USER_AGENT)).await?;
    let factory = SharedInformerFactory::new(Duration::from_secs(args.resync_seconds));

    let mut pods = factory.for_resource::<Pod>().in_namespace(args.namespace.clone());
    if let Some(selector) = &args.selector {
        pods = pods.with_label_selector(selector.clone());
    }
    let informer = pods.build_from_client(client)?;
    informer.add_index(NODE_INDEX, node_of)?;

    let controller = Arc::new(Controller::new(
        "pod-logger",
        Arc::clone(&informer),
        LogPods,
        ControllerConfig {
            workers: args.workers,
            max_retries: args.max_retries,
        },
    ));

    factory.start();
    let running = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run().await }
    });

    if factory
        .wait_for_cache_sync(Duration::from_secs(args.sync_timeout_seconds))
        .await
    {
        let cache = informer.indexer();
        let nodes = cache.index_values(NODE_INDEX)?;
        info!(
            "✅ {} pods cached in {} across {} nodes",
            cache.len(),
            args.namespace,
            nodes.len()
        );
    } else {
        warn!("⏳ pod cache for {} is still syncing", args.namespace);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("⚠️  cannot listen for Ctrl-C: {}", e);
    }
    info!("🛑 shutting down");
    controller.shutdown();
    factory.shutdown();
    if let Err(e) = running.await {
        warn!("⚠️  controller task failed: {}", e);
    }
    Ok(())
}
