use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{errors::Error, utils::mask_secret, Result};

/// Password value that disables the access guard.
pub const PASSWORD_DISABLED: &str = "none";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8088";
pub const DEFAULT_WORKER_PORT: u16 = 8088;
pub const DEFAULT_SUPERVISED_WORKER_PORT: u16 = 8089;
pub const DEFAULT_MANAGEMENT_PORT: u16 = 8088;

/// Worker run mode. `p` (public upload) is the only mode; anything else folds into it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Public,
}

impl Mode {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed != "p" {
            tracing::warn!(mode = trimmed, "unknown MODE, falling back to public upload (p)");
        }
        Mode::Public
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Public => "p",
        }
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(Mode::parse(&raw))
    }
}

/// Immutable worker configuration.
///
/// Built once at startup (flags/env, optionally overlaid by a persisted file) and passed
/// explicitly. Changing it means building a new value and restarting the worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub target: String,
    #[serde(default = "default_pass")]
    pub pass: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(
        default = "default_port",
        deserialize_with = "port_from_str_or_int"
    )]
    pub port: u16,
}

fn default_pass() -> String {
    PASSWORD_DISABLED.to_string()
}

fn default_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_WORKER_PORT
}

fn port_from_str_or_int<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u16),
        Str(String),
    }

    match Raw::deserialize(d)? {
        Raw::Int(p) => Ok(p),
        Raw::Str(s) if s.trim().is_empty() => Ok(DEFAULT_WORKER_PORT),
        Raw::Str(s) => s
            .trim()
            .parse::<u16>()
            .map_err(|e| serde::de::Error::custom(format!("invalid port {s:?}: {e}"))),
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            target: String::new(),
            pass: default_pass(),
            mode: Mode::Public,
            url: default_url(),
            port: DEFAULT_WORKER_PORT,
        }
    }
}

/// Worker flags. Every flag falls back to the matching environment variable.
#[derive(Clone, Debug, Default, clap::Args)]
pub struct ServiceArgs {
    /// Telegram bot token
    #[arg(long, env = "TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,

    /// Target channel: numeric chat id or @username
    #[arg(long, env = "TARGET", default_value = "")]
    pub target: String,

    /// Access password ("none" disables the password gate)
    #[arg(long, env = "PASS", default_value = PASSWORD_DISABLED, hide_env_values = true)]
    pub pass: String,

    /// Run mode (only "p" is supported)
    #[arg(long, env = "MODE", default_value = "p")]
    pub mode: String,

    /// Public base URL used to build download links
    #[arg(long, env = "URL", default_value = DEFAULT_BASE_URL)]
    pub url: String,

    /// Worker HTTP port
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
}

impl ServiceConfig {
    pub fn from_args(args: ServiceArgs, default_port: u16) -> Self {
        Self {
            token: args.token.trim().to_string(),
            target: args.target.trim().to_string(),
            pass: non_empty(args.pass).unwrap_or_else(default_pass),
            mode: Mode::parse(&args.mode),
            url: non_empty(args.url).unwrap_or_else(default_url),
            port: args.port.unwrap_or(default_port),
        }
    }

    /// True when both bot token and channel are set. Without them the worker runs in
    /// degraded mode and answers uploads with `tgstate_not_configured`.
    pub fn is_configured(&self) -> bool {
        !self.token.trim().is_empty() && !self.target.trim().is_empty()
    }

    /// The access password, or `None` when the gate is disabled.
    pub fn password(&self) -> Option<&str> {
        let p = self.pass.as_str();
        if p.is_empty() || p == PASSWORD_DISABLED {
            None
        } else {
            Some(p)
        }
    }

    /// Base URL without trailing slashes.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config("port must be between 1 and 65535".to_string()));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "url must start with http:// or https://, got {:?}",
                self.url
            )));
        }
        if !self.target.trim().is_empty() {
            ChannelTarget::parse(&self.target)?;
        }
        Ok(())
    }

    /// CLI flags of the worker invocation contract.
    pub fn worker_args(&self) -> Vec<String> {
        vec![
            "--token".to_string(),
            self.token.clone(),
            "--target".to_string(),
            self.target.clone(),
            "--pass".to_string(),
            self.pass.clone(),
            "--mode".to_string(),
            self.mode.as_str().to_string(),
            "--url".to_string(),
            self.url.clone(),
            "--port".to_string(),
            self.port.to_string(),
        ]
    }

    /// Environment variables of the worker invocation contract.
    pub fn worker_env(&self) -> Vec<(String, String)> {
        vec![
            ("TOKEN".to_string(), self.token.clone()),
            ("TARGET".to_string(), self.target.clone()),
            ("PASS".to_string(), self.pass.clone()),
            ("MODE".to_string(), self.mode.as_str().to_string()),
            ("URL".to_string(), self.url.clone()),
            ("PORT".to_string(), self.port.to_string()),
        ]
    }

    /// One-line summary safe to log.
    pub fn redacted(&self) -> String {
        format!(
            "token={} target={} pass={} mode={} url={} port={}",
            mask_secret(&self.token),
            self.target,
            if self.password().is_some() { "set" } else { "none" },
            self.mode.as_str(),
            self.url,
            self.port
        )
    }
}

/// Where uploads are posted: a numeric chat id (`-100...`) or a public `@username`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelTarget {
    Id(i64),
    Username(String),
}

impl ChannelTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        static USERNAME: OnceLock<Regex> = OnceLock::new();
        let username = USERNAME.get_or_init(|| {
            Regex::new(r"^@[A-Za-z][A-Za-z0-9_]{3,31}$").expect("static regex is valid")
        });

        let raw = raw.trim();
        if let Ok(id) = raw.parse::<i64>() {
            return Ok(ChannelTarget::Id(id));
        }
        if username.is_match(raw) {
            return Ok(ChannelTarget::Username(raw.to_string()));
        }
        Err(Error::Config(format!(
            "TARGET must be a numeric chat id or an @username, got {raw:?}"
        )))
    }
}

/// Supervisor-only settings. These never reach the worker.
#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub worker_bin: PathBuf,
    pub management_port: u16,
    pub auto_start: bool,
    pub stop_grace: Duration,
    pub restart_settle: Duration,
    pub config_restart_delay: Duration,
    pub restart_on_crash: bool,
    pub config_file: Option<PathBuf>,
}

impl SupervisorSettings {
    pub fn from_env() -> Self {
        let worker_bin = env_path("TGS_WORKER_BIN").unwrap_or_else(default_worker_bin);

        Self {
            worker_bin,
            management_port: env_u16("TGS_MANAGEMENT_PORT").unwrap_or(DEFAULT_MANAGEMENT_PORT),
            auto_start: env_bool("TGS_AUTO_START").unwrap_or(true),
            stop_grace: Duration::from_millis(env_u64("TGS_STOP_GRACE_MS").unwrap_or(10_000)),
            restart_settle: Duration::from_millis(
                env_u64("TGS_RESTART_SETTLE_MS").unwrap_or(2_000),
            ),
            config_restart_delay: Duration::from_millis(
                env_u64("TGS_CONFIG_RESTART_DELAY_MS").unwrap_or(1_000),
            ),
            restart_on_crash: env_bool("TGS_RESTART_ON_CRASH").unwrap_or(true),
            config_file: env_path("TGS_CONFIG_FILE"),
        }
    }
}

/// `tgs` next to the running executable, else `tgs` from `PATH`.
fn default_worker_bin() -> PathBuf {
    let name = if cfg!(windows) { "tgs.exe" } else { "tgs" };
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .filter(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from(name))
}

/// Read a config previously written by [`persist_config`]. A missing file is `Ok(None)`.
pub fn load_persisted_config(path: &Path) -> Result<Option<ServiceConfig>> {
    let raw = match fs::read_to_string(path) {
        Ok(v) => v,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    let cfg: ServiceConfig = serde_json::from_str(&raw)?;
    Ok(Some(cfg))
}

/// Write the config atomically (temp file + rename).
pub fn persist_config(path: &Path, cfg: &ServiceConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(cfg)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load `KEY=value` lines from a `.env` file without overriding the real environment.
pub fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u16(key: &str) -> Option<u16> {
    env_str(key).and_then(|s| s.trim().parse::<u16>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.trim().to_string())
    }
}
