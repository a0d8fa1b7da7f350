//! Grafana server settings and the per-request ini file

use std::path::PathBuf;
use std::time::Duration;

/// Fixed facts about the provisioned server and its local layout
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Provisioned Grafana home; the binary lives at `bin/grafana-server`
    pub home: PathBuf,
    /// Parent of the `data/`, `plugins/` and `logs/` directories
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub pidfile: PathBuf,
    pub port: u16,
    /// External routing prefix the gateway serves Grafana under
    pub path_prefix: String,
    pub anonymous_access: bool,
    pub anonymous_org_role: String,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            home: PathBuf::from("/var/task/grafana"),
            state_dir: PathBuf::from("/tmp/grafana"),
            config_path: PathBuf::from("/tmp/grafana.conf"),
            pidfile: PathBuf::from("/tmp/grafana.pid"),
            port: 3000,
            path_prefix: "/grafana".to_string(),
            anonymous_access: false,
            anonymous_org_role: "Viewer".to_string(),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerSettings {
    pub fn binary(&self) -> PathBuf {
        self.home.join("bin").join("grafana-server")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.state_dir.join("data")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.state_dir.join("plugins")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}

/// What the server must know about how clients reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerContext {
    /// External host name from the inbound `Host` header
    pub domain: String,
    /// Gateway stage, the first path segment clients see
    pub stage: String,
}

/// Render the ini file Grafana is started with.
///
/// `root_url` must match the externally visible URL or Grafana's redirects
/// and asset links escape the gateway's stage and prefix.
pub fn render_config(settings: &ServerSettings, context: &ServerContext) -> String {
    let prefix = settings.path_prefix.trim_end_matches('/');
    let stage = context.stage.trim_matches('/');
    let root_url = if stage.is_empty() {
        format!("https://{}{}/", context.domain, prefix)
    } else {
        format!("https://{}/{}{}/", context.domain, stage, prefix)
    };

    format!(
        "[server]\n\
         domain = {domain}\n\
         http_addr = 127.0.0.1\n\
         http_port = {port}\n\
         root_url = {root_url}\n\
         \n\
         [paths]\n\
         data = {data}\n\
         logs = {logs}\n\
         plugins = {plugins}\n\
         \n\
         [auth.anonymous]\n\
         enabled = {anonymous}\n\
         org_role = {role}\n",
        domain = context.domain,
        port = settings.port,
        root_url = root_url,
        data = settings.data_dir().display(),
        logs = settings.logs_dir().display(),
        plugins = settings.plugins_dir().display(),
        anonymous = settings.anonymous_access,
        role = settings.anonymous_org_role,
    )
}
