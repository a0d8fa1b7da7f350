//! grafana-lambda runtime entry point
//!
//! Deployed as the `bootstrap` executable of a custom Lambda runtime.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use aws_config::BehaviorVersion;
use chrono::{DateTime, Utc};
use clap::Parser;
use lambda_runtime::{service_fn, LambdaEvent};
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use grafana_lambda::clock::SystemClock;
use grafana_lambda::lock::DynamoLockStore;
use grafana_lambda::proxy::{GatewayRequestEvent, GatewayResponse};
use grafana_lambda::sync::{DynamoIndexStore, S3ObjectStore};
use grafana_lambda::{Config, Invocation, RequestRouter};

#[derive(Parser, Debug)]
#[command(name = "bootstrap")]
#[command(about = "Grafana behind API Gateway on AWS Lambda")]
#[command(version)]
struct Args {
    /// Versioned S3 bucket for Grafana state
    #[arg(long, env = "FILES_BUCKET")]
    files_bucket: String,

    /// Key prefix for Grafana state objects
    #[arg(long, env = "FILES_PREFIX")]
    files_prefix: String,

    /// DynamoDB table holding the file index
    #[arg(long, env = "FILES_TABLE")]
    files_table: String,

    /// DynamoDB table holding the lock
    #[arg(long, env = "LOCK_TABLE")]
    lock_table: String,

    #[arg(long, env = "LOCK_ID", default_value = "1")]
    lock_id: String,

    #[arg(long, env = "FILES_ID", default_value = "1")]
    files_id: String,

    /// Seconds added to the remaining invocation time for the lease
    #[arg(long, env = "LOCK_MARGIN_SECS", default_value = "10")]
    lock_margin_secs: u64,

    /// Skip indexed files whose object has disappeared instead of failing
    #[arg(long, env = "TOLERATE_MISSING_OBJECTS")]
    tolerate_missing_objects: bool,

    /// Provisioned Grafana home (contains bin/grafana-server)
    #[arg(long, env = "GRAFANA_HOME", default_value = "/var/task/grafana")]
    grafana_home: PathBuf,

    /// Writable directory holding data/, plugins/ and logs/
    #[arg(long, env = "GRAFANA_STATE_DIR", default_value = "/tmp/grafana")]
    state_dir: PathBuf,

    #[arg(long, env = "GRAFANA_CONFIG", default_value = "/tmp/grafana.conf")]
    config_path: PathBuf,

    #[arg(long, env = "GRAFANA_PIDFILE", default_value = "/tmp/grafana.pid")]
    pidfile: PathBuf,

    #[arg(long, env = "GRAFANA_PORT", default_value = "3000")]
    port: u16,

    /// External path prefix Grafana is served under
    #[arg(long, env = "PATH_PREFIX", default_value = "/grafana")]
    path_prefix: String,

    /// Paths below this (after the prefix) skip locking and sync
    #[arg(long, env = "STATIC_PREFIX", default_value = "/public/")]
    static_prefix: String,

    #[arg(long, env = "ANONYMOUS_ACCESS")]
    anonymous_access: bool,

    #[arg(long, env = "ANONYMOUS_ORG_ROLE", default_value = "Viewer")]
    anonymous_org_role: String,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: String,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            files_bucket: self.files_bucket,
            files_prefix: self.files_prefix,
            files_table: self.files_table,
            lock_table: self.lock_table,
            lock_id: self.lock_id,
            files_id: self.files_id,
            lock_margin: Duration::from_secs(self.lock_margin_secs),
            tolerate_missing_objects: self.tolerate_missing_objects,
            grafana_home: self.grafana_home,
            state_dir: self.state_dir,
            config_path: self.config_path,
            pidfile: self.pidfile,
            port: self.port,
            path_prefix: self.path_prefix,
            static_prefix: self.static_prefix,
            anonymous_access: self.anonymous_access,
            anonymous_org_role: self.anonymous_org_role,
        }
    }
}

fn init_tracing(format: &str) {
    let json = format.eq_ignore_ascii_case("json");
    tracing_subscriber::registry()
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
        }))
        .with((!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .without_time()
        }))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn handle(
    router: Arc<Mutex<RequestRouter>>,
    event: LambdaEvent<GatewayRequestEvent>,
) -> Result<GatewayResponse, lambda_runtime::Error> {
    let deadline = DateTime::from_timestamp_millis(event.context.deadline as i64)
        .unwrap_or_else(Utc::now);
    tracing::debug!(request_id = %event.context.request_id, %deadline, "Invocation");

    let mut router = router.lock().await;
    let response = router
        .handle(&event.payload, Invocation { deadline })
        .await
        .inspect_err(|e| tracing::error!("Request failed: {}", e))?;
    Ok(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_format);

    let config = args.into_config();
    config.validate().context("invalid configuration")?;

    let aws = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let router = RequestRouter::from_config(
        &config,
        Arc::new(DynamoLockStore::new(&aws, &config.lock_table)),
        Arc::new(DynamoIndexStore::new(&aws, &config.files_table, &config.files_id)),
        Arc::new(S3ObjectStore::new(&aws, &config.files_bucket)),
        Arc::new(SystemClock),
    )
    .context("failed to build request router")?;
    let router = Arc::new(Mutex::new(router));

    tracing::info!(version = grafana_lambda::VERSION, "grafana-lambda ready");

    lambda_runtime::run(service_fn(move |event| handle(router.clone(), event)))
        .await
        .map_err(|e| anyhow::anyhow!(e))
}
