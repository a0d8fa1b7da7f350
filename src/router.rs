//! Per-request control flow
//!
//! Static assets are read-only, so they skip the lock and reuse whatever
//! server this environment already runs. Everything else may write to the
//! SQLite database and runs under the lease lock with a full
//! download / serve / upload cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::Result;
use crate::lock::{LeaseLock, LockStore};
use crate::process::{ProcessSupervisor, ServerContext};
use crate::proxy::{strip_path_prefix, GatewayRequestEvent, GatewayResponse, RequestTranslator};
use crate::sync::{DataSynchronizer, IndexStore, ObjectStore};

/// How a request is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// No lock, no sync
    Bypass,
    /// Under the lease lock with state sync
    Exclusive,
}

/// Facts about the current invocation supplied by the platform
#[derive(Debug, Clone, Copy)]
pub struct Invocation {
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub path_prefix: String,
    pub static_prefix: String,
    /// Added to the remaining invocation time to form the lease
    pub lock_margin: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            path_prefix: "/grafana".to_string(),
            static_prefix: "/public/".to_string(),
            lock_margin: Duration::from_secs(10),
        }
    }
}

pub struct RequestRouter {
    lock: LeaseLock,
    sync: DataSynchronizer,
    supervisor: ProcessSupervisor,
    translator: RequestTranslator,
    clock: SharedClock,
    settings: RouterSettings,
}

impl RequestRouter {
    pub fn new(
        lock: LeaseLock,
        sync: DataSynchronizer,
        supervisor: ProcessSupervisor,
        translator: RequestTranslator,
        clock: SharedClock,
        settings: RouterSettings,
    ) -> Self {
        Self {
            lock,
            sync,
            supervisor,
            translator,
            clock,
            settings,
        }
    }

    /// Wire every component from `config` around the given backends
    pub fn from_config(
        config: &Config,
        lock_store: Arc<dyn LockStore>,
        index_store: Arc<dyn IndexStore>,
        objects: Arc<dyn ObjectStore>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;

        let lock = LeaseLock::new(
            lock_store,
            clock.clone(),
            config.lock_id.clone(),
            config.lock_settings(),
        );
        let sync = DataSynchronizer::new(
            objects,
            index_store,
            clock.clone(),
            config.sync_settings(),
        );
        let supervisor = ProcessSupervisor::new(config.server_settings());
        let translator = RequestTranslator::new(config.proxy_settings(), clock.clone())?;

        Ok(Self::new(
            lock,
            sync,
            supervisor,
            translator,
            clock,
            config.router_settings(),
        ))
    }

    pub fn classify(&self, path: &str) -> Route {
        let local = strip_path_prefix(path, &self.settings.path_prefix);
        if local.starts_with(&self.settings.static_prefix) {
            Route::Bypass
        } else {
            Route::Exclusive
        }
    }

    pub fn lock(&self) -> &LeaseLock {
        &self.lock
    }

    pub fn sync(&self) -> &DataSynchronizer {
        &self.sync
    }

    pub fn supervisor_mut(&mut self) -> &mut ProcessSupervisor {
        &mut self.supervisor
    }

    /// Serve one gateway event
    pub async fn handle(
        &mut self,
        event: &GatewayRequestEvent,
        invocation: Invocation,
    ) -> Result<GatewayResponse> {
        self.supervisor.ensure_provisioned()?;

        let context = ServerContext {
            domain: event.host()?.to_string(),
            stage: event.request_context.stage.clone(),
        };

        let route = self.classify(&event.path);
        tracing::info!(method = %event.http_method, path = %event.path, ?route, "Handling request");

        match route {
            Route::Bypass => self.bypass(event, &context).await,
            Route::Exclusive => self.exclusive(event, &context, invocation).await,
        }
    }

    async fn bypass(
        &mut self,
        event: &GatewayRequestEvent,
        context: &ServerContext,
    ) -> Result<GatewayResponse> {
        self.supervisor.start_if_needed(context).await?;
        let response = self.translator.forward(event).await?;
        self.supervisor.mark_ready();
        Ok(response)
    }

    async fn exclusive(
        &mut self,
        event: &GatewayRequestEvent,
        context: &ServerContext,
        invocation: Invocation,
    ) -> Result<GatewayResponse> {
        // A server left over from a bypass request may hold a stale config
        // and must not touch the database while another environment syncs.
        self.supervisor.stop().await;

        let remaining = (invocation.deadline - self.clock.now())
            .to_std()
            .unwrap_or_default();
        self.lock
            .acquire_within(remaining + self.settings.lock_margin, Some(remaining))
            .await?;

        let outcome = self.exclusive_locked(event, context).await;

        match (outcome, self.lock.release().await) {
            (Ok(response), Ok(())) => Ok(response),
            (Ok(_), Err(release_error)) => Err(release_error),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(release_error)) => {
                tracing::error!("Lock release failed after request error: {}", release_error);
                Err(error)
            }
        }
    }

    async fn exclusive_locked(
        &mut self,
        event: &GatewayRequestEvent,
        context: &ServerContext,
    ) -> Result<GatewayResponse> {
        let download = self.sync.download_changed().await?;
        tracing::info!(
            files = download.files_transferred,
            bytes = download.bytes_transferred,
            "Downloaded changed files"
        );

        let forwarded = match self.supervisor.start_if_needed(context).await {
            Ok(()) => self.translator.forward(event).await,
            Err(e) => Err(e),
        };
        if forwarded.is_ok() {
            self.supervisor.mark_ready();
        }
        self.supervisor.stop().await;
        let response = forwarded?;

        let upload = self.sync.upload_changed().await?;
        tracing::info!(
            files = upload.files_transferred,
            bytes = upload.bytes_transferred,
            "Uploaded changed files"
        );

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lock::MemoryLockStore;
    use crate::sync::{MemoryIndexStore, MemoryObjectStore};

    fn router() -> RequestRouter {
        RequestRouter::from_config(
            &Config::for_bucket("bucket", "prefix"),
            Arc::new(MemoryLockStore::new()),
            Arc::new(MemoryIndexStore::new()),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(ManualClock::at_epoch(1_000)),
        )
        .unwrap()
    }

    #[test]
    fn test_classify() {
        let router = router();
        assert_eq!(router.classify("/grafana/public/img/x.png"), Route::Bypass);
        assert_eq!(router.classify("/grafana/public/build/app.js"), Route::Bypass);
        assert_eq!(router.classify("/grafana/api/dashboards"), Route::Exclusive);
        assert_eq!(router.classify("/grafana/"), Route::Exclusive);
        assert_eq!(router.classify("/grafana/publicity"), Route::Exclusive);
        assert_eq!(router.classify("/grafana/login"), Route::Exclusive);
    }
}
