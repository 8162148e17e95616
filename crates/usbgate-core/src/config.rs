//! Configuration model and helpers used by usbgate services.

use crate::error::{GateError, GateResult};
use directories_next::ProjectDirs;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/usbgate.toml";
/// Environment variable consulted by the binaries before `DEFAULT_CONFIG_PATH`.
pub const CONFIG_PATH_ENV: &str = "USBGATE_CONFIG";
const BOOTSTRAP_FILE_NAME: &str = "usbgate.toml";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "usbgate";
const APP_NAME: &str = "usbgate";

/// Resolve the configuration path from the environment, falling back to the default.
pub fn config_path_from_env() -> PathBuf {
    env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Platform power-off command used when `shutdown.command` is not set.
pub fn default_shutdown_command() -> Vec<String> {
    if cfg!(windows) {
        vec!["shutdown".into(), "/s".into(), "/t".into(), "0".into()]
    } else {
        vec!["shutdown".into(), "-h".into(), "now".into()]
    }
}

fn render_bootstrap_template() -> String {
    let command = default_shutdown_command()
        .iter()
        .map(|arg| format!("\"{arg}\""))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "# Auto-generated usbgate configuration bootstrap.\n# Review these values before enabling the daemon.\n\n[poll]\ninterval_secs = {poll}\nquery_timeout_secs = {query}\n\n[lock]\n# Seconds the host stays locked before it is powered off.\ngrace_secs = {grace}\ntick_millis = {tick}\n\n[registry]\nstore_path = '{store}'\n\n[remote]\n# url = \"https://example.invalid/rest/v1/allowed_devices\"\n# The service key is read from this environment variable, never from this file.\napi_key_env = \"{key_env}\"\n# api_key_file = \"/etc/usbgate/remote.key\"\ntimeout_secs = {remote_timeout}\n# Re-fetch the remote list every N seconds (0 disables).\nrefresh_secs = 0\n\n[shutdown]\ncommand = [{command}]\ndry_run = false\n\n[status]\naddr = \"{status}\"\n",
        poll = default_poll_interval_secs(),
        query = default_query_timeout_secs(),
        grace = default_grace_secs(),
        tick = default_tick_millis(),
        store = default_store_path(),
        key_env = default_api_key_env(),
        remote_timeout = default_remote_timeout_secs(),
        command = command,
        status = default_status_addr(),
    )
}

pub fn bootstrap_template() -> String {
    render_bootstrap_template()
}

/// Presence poll cadence and OS query bound.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PollCfg {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_query_timeout_secs() -> u64 {
    5
}

impl Default for PollCfg {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

/// Grace period and countdown resolution for a lock session.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LockCfg {
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u32,

    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

fn default_grace_secs() -> u32 {
    160
}

fn default_tick_millis() -> u64 {
    1_000
}

impl Default for LockCfg {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
            tick_millis: default_tick_millis(),
        }
    }
}

/// Where the authorization registry is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RegistryCfg {
    #[serde(default = "default_store_path")]
    pub store_path: String,
}

fn default_store_path() -> String {
    if cfg!(windows) {
        r"C:\ProgramData\usbgate\allowed_serials.json".to_string()
    } else {
        "/var/lib/usbgate/allowed_serials.json".to_string()
    }
}

impl Default for RegistryCfg {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
        }
    }
}

/// Remote authoritative device list. Sync is disabled while `url` is unset.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RemoteCfg {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default)]
    pub api_key_file: Option<String>,

    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub refresh_secs: u64,
}

fn default_api_key_env() -> String {
    "USBGATE_REMOTE_KEY".to_string()
}

fn default_remote_timeout_secs() -> u64 {
    10
}

impl Default for RemoteCfg {
    fn default() -> Self {
        Self {
            url: None,
            api_key_env: default_api_key_env(),
            api_key_file: None,
            timeout_secs: default_remote_timeout_secs(),
            refresh_secs: 0,
        }
    }
}

/// Power-off action taken when a lock session expires.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ShutdownCfg {
    #[serde(default = "default_shutdown_command")]
    pub command: Vec<String>,

    #[serde(default)]
    pub dry_run: bool,
}

impl Default for ShutdownCfg {
    fn default() -> Self {
        Self {
            command: default_shutdown_command(),
            dry_run: false,
        }
    }
}

/// Plain-text status endpoint. An empty address disables it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StatusCfg {
    #[serde(default = "default_status_addr")]
    pub addr: String,
}

fn default_status_addr() -> String {
    "127.0.0.1:8788".to_string()
}

impl Default for StatusCfg {
    fn default() -> Self {
        Self {
            addr: default_status_addr(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct UsbgateConfig {
    #[serde(default)]
    pub poll: PollCfg,

    #[serde(default)]
    pub lock: LockCfg,

    #[serde(default)]
    pub registry: RegistryCfg,

    #[serde(default)]
    pub remote: RemoteCfg,

    #[serde(default)]
    pub shutdown: ShutdownCfg,

    #[serde(default)]
    pub status: StatusCfg,

    #[serde(skip)]
    pub path: PathBuf,
}

/// On-disk syntax, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Yaml,
}

impl UsbgateConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path used for bootstrapping.
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(BOOTSTRAP_FILE_NAME))
    }

    /// Load configuration from disk, creating a bootstrap copy when missing.
    ///
    /// Only the system-wide default falls back to a per-user copy when it
    /// cannot be written; explicit paths fail instead.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> GateResult<Self> {
        let requested = path.as_ref();
        let resolved = match write_template_if_absent(requested) {
            Ok(()) => requested.to_path_buf(),
            Err(err) if requested == Self::default_path() => {
                let user_path = Self::user_config_path().ok_or_else(|| {
                    GateError::InvalidConfig(format!(
                        "cannot write {DEFAULT_CONFIG_PATH} ({err}) and no user config directory is known"
                    ))
                })?;
                write_template_if_absent(&user_path).map_err(|user_err| {
                    GateError::InvalidConfig(format!(
                        "cannot write {DEFAULT_CONFIG_PATH} ({err}) or {} ({user_err})",
                        user_path.display()
                    ))
                })?;
                warn!(
                    "{} is not writable ({err}); falling back to {}",
                    requested.display(),
                    user_path.display()
                );
                user_path
            }
            Err(err) => {
                return Err(GateError::InvalidConfig(format!(
                    "cannot create configuration at {}: {err}",
                    requested.display()
                )))
            }
        };
        Self::load(resolved)
    }

    /// Read a config file from disk, detect format, and reject unusable values.
    pub fn load<P: AsRef<Path>>(path: P) -> GateResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = match ConfigFormat::from_path(path) {
            ConfigFormat::Toml => toml::from_str::<Self>(&contents)?,
            ConfigFormat::Yaml => serde_yaml::from_str::<Self>(&contents)?,
        };
        cfg.path = path.to_path_buf();

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(GateError::InvalidConfig(issues.join("; ")));
        }

        Ok(cfg)
    }

    /// Perform a validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.poll.interval_secs == 0 {
            issues.push("poll.interval_secs must be greater than 0".to_string());
        }
        if self.poll.query_timeout_secs == 0 {
            issues.push("poll.query_timeout_secs must be greater than 0".to_string());
        }
        if self.lock.tick_millis == 0 {
            issues.push("lock.tick_millis must be greater than 0".to_string());
        }
        if self.registry.store_path.trim().is_empty() {
            issues.push("registry.store_path must not be empty".to_string());
        }

        if let Some(url) = &self.remote.url {
            let trimmed = url.trim();
            if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
                issues.push(format!("remote.url must be an http(s) URL: {trimmed}"));
            }
        }
        if self.remote.timeout_secs == 0 {
            issues.push("remote.timeout_secs must be greater than 0".to_string());
        }

        if !self.shutdown.dry_run
            && self
                .shutdown
                .command
                .first()
                .map(|program| program.trim().is_empty())
                .unwrap_or(true)
        {
            issues.push("shutdown.command must name a program".to_string());
        }

        if !self.status.addr.trim().is_empty()
            && self.status.addr.trim().parse::<SocketAddr>().is_err()
        {
            issues.push(format!(
                "status.addr is not a socket address: {}",
                self.status.addr
            ));
        }

        issues
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll.interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.poll.query_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.lock.tick_millis)
    }

    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.registry.store_path)
    }

    /// Parsed status endpoint address, `None` when disabled.
    pub fn status_addr(&self) -> Option<SocketAddr> {
        let trimmed = self.status.addr.trim();
        if trimmed.is_empty() {
            return None;
        }
        trimmed.parse().ok()
    }

    /// Interval for periodic remote re-sync, `None` when disabled.
    pub fn remote_refresh(&self) -> Option<Duration> {
        match self.remote.refresh_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Resolve the remote service key from the environment or a key file.
    ///
    /// The environment wins; a missing or unreadable key file yields `None`.
    pub fn remote_api_key(&self) -> Option<String> {
        if let Ok(value) = env::var(&self.remote.api_key_env) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }

        let path = self.remote.api_key_file.as_deref()?;
        match fs::read_to_string(path) {
            Ok(contents) => Some(contents.trim().to_string()).filter(|key| !key.is_empty()),
            Err(err) => {
                warn!("failed to read remote.api_key_file {path}: {err}");
                None
            }
        }
    }
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                ConfigFormat::Yaml
            }
            _ => ConfigFormat::Toml,
        }
    }
}

/// Write the bootstrap template to `path` unless a file is already there.
fn write_template_if_absent(path: &Path) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
        Err(err) => return Err(err),
    };
    // System-wide copies stay group-readable for the service account.
    #[cfg(unix)]
    file.set_permissions(fs::Permissions::from_mode(if path.starts_with("/etc") {
        0o640
    } else {
        0o600
    }))?;
    file.write_all(render_bootstrap_template().as_bytes())?;
    info!("usbgate config bootstrap written to {}", path.display());
    Ok(())
}
