//! Runtime configuration
//!
//! Populated from the environment by the `bootstrap` binary; the library
//! itself never reads env vars.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GrafanaLambdaError, Result};
use crate::lock::LockSettings;
use crate::process::ServerSettings;
use crate::proxy::ProxySettings;
use crate::router::RouterSettings;
use crate::sync::SyncSettings;

#[derive(Debug, Clone)]
pub struct Config {
    /// Versioned bucket holding synced files
    pub files_bucket: String,
    pub files_prefix: String,
    pub files_table: String,
    pub lock_table: String,
    pub lock_id: String,
    pub files_id: String,
    pub lock_margin: Duration,
    pub tolerate_missing_objects: bool,
    pub grafana_home: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub pidfile: PathBuf,
    pub port: u16,
    pub path_prefix: String,
    pub static_prefix: String,
    pub anonymous_access: bool,
    pub anonymous_org_role: String,
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerSettings::default();
        Self {
            files_bucket: String::new(),
            files_prefix: String::new(),
            files_table: String::new(),
            lock_table: String::new(),
            lock_id: "1".to_string(),
            files_id: "1".to_string(),
            lock_margin: Duration::from_secs(10),
            tolerate_missing_objects: false,
            grafana_home: server.home,
            state_dir: server.state_dir,
            config_path: server.config_path,
            pidfile: server.pidfile,
            port: server.port,
            path_prefix: server.path_prefix,
            static_prefix: "/public/".to_string(),
            anonymous_access: server.anonymous_access,
            anonymous_org_role: server.anonymous_org_role,
        }
    }
}

impl Config {
    /// Defaults with the remote file location filled in
    pub fn for_bucket(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            files_bucket: bucket.into(),
            files_prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.files_bucket.is_empty() {
            return Err(GrafanaLambdaError::Config("files bucket is required".to_string()));
        }
        for (name, prefix) in [
            ("path prefix", &self.path_prefix),
            ("static prefix", &self.static_prefix),
        ] {
            if !prefix.starts_with('/') {
                return Err(GrafanaLambdaError::Config(format!(
                    "{} must start with '/': {}",
                    name, prefix
                )));
            }
        }
        if self.lock_id.is_empty() || self.files_id.is_empty() {
            return Err(GrafanaLambdaError::Config(
                "lock and files ids must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings::default()
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            state_dir: self.state_dir.clone(),
            prefix: self.files_prefix.clone(),
            tolerate_missing: self.tolerate_missing_objects,
            ..SyncSettings::default()
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            home: self.grafana_home.clone(),
            state_dir: self.state_dir.clone(),
            config_path: self.config_path.clone(),
            pidfile: self.pidfile.clone(),
            port: self.port,
            path_prefix: self.path_prefix.clone(),
            anonymous_access: self.anonymous_access,
            anonymous_org_role: self.anonymous_org_role.clone(),
            ..ServerSettings::default()
        }
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            target: format!("http://127.0.0.1:{}", self.port),
            path_prefix: self.path_prefix.clone(),
            ..ProxySettings::default()
        }
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            path_prefix: self.path_prefix.clone(),
            static_prefix: self.static_prefix.clone(),
            lock_margin: self.lock_margin,
        }
    }
}
