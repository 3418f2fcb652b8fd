use crate::error::ConfigError;
use std::{env, path::PathBuf, time::Duration};

const DEFAULT_STATUS_INTERVAL_SECS: u64 = 5;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 3;
const DEFAULT_AUTO_DELETE_SECS: i64 = 20;
const DEFAULT_ENGINE_SETUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ARIA2_RPC_URL: &str = "http://localhost:6800/jsonrpc";
const DEFAULT_JDOWNLOADER_HOST: &str = "http://localhost:5800";
const DEFAULT_EXTRACT_COMMAND: &str = "extract";

#[derive(Clone, Debug)]
pub struct Config {
    pub bot_token: String,
    pub download_dir: PathBuf,
    pub status_interval: Duration,
    pub poll_interval: Duration,
    /// Upper bound on an engine's add call before the job is rolled back.
    pub engine_setup_timeout: Duration,
    /// `None` keeps replies around forever (`AUTO_DELETE_MESSAGE_DURATION=-1`).
    pub auto_delete: Option<Duration>,
    pub index_url: Option<String>,
    pub aria2: Aria2Config,
    pub jdownloader: Option<JDownloaderConfig>,
    pub mega: Option<Credentials>,
    pub drive: Option<DriveConfig>,
    pub extract_command: String,
}

#[derive(Clone, Debug)]
pub struct Aria2Config {
    pub rpc_url: String,
    pub secret: Option<String>,
}

#[derive(Clone, Debug)]
pub struct JDownloaderConfig {
    pub host: String,
    pub credentials: Option<Credentials>,
    pub device_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct DriveConfig {
    pub folder_id: String,
    pub access_token: String,
    pub team_drive: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bot_token = get("BOT_TOKEN").ok_or(ConfigError::Missing("BOT_TOKEN"))?;
        let mut download_dir = get("DOWNLOAD_DIR").ok_or(ConfigError::Missing("DOWNLOAD_DIR"))?;
        if !download_dir.ends_with('/') && !download_dir.ends_with('\\') {
            download_dir.push('/');
        }

        let status_interval = positive_secs(
            "DOWNLOAD_STATUS_UPDATE_INTERVAL",
            get("DOWNLOAD_STATUS_UPDATE_INTERVAL"),
            DEFAULT_STATUS_INTERVAL_SECS,
        )?;
        let poll_interval = positive_secs(
            "POLL_INTERVAL",
            get("POLL_INTERVAL"),
            DEFAULT_POLL_INTERVAL_SECS,
        )?;
        let engine_setup_timeout = positive_secs(
            "ENGINE_SETUP_TIMEOUT",
            get("ENGINE_SETUP_TIMEOUT"),
            DEFAULT_ENGINE_SETUP_TIMEOUT_SECS,
        )?;
        let auto_delete_secs: i64 = parse_or(
            "AUTO_DELETE_MESSAGE_DURATION",
            get("AUTO_DELETE_MESSAGE_DURATION"),
            DEFAULT_AUTO_DELETE_SECS,
        )?;
        let auto_delete =
            (auto_delete_secs >= 0).then(|| Duration::from_secs(auto_delete_secs as u64));

        let aria2 = Aria2Config {
            rpc_url: get("ARIA2_RPC_URL").unwrap_or_else(|| DEFAULT_ARIA2_RPC_URL.to_string()),
            secret: get("ARIA2_SECRET"),
        };

        let jd_credentials = credentials(get("JDOWNLOADER_USERNAME"), get("JDOWNLOADER_PASSWORD"));
        let jd_host = get("JDOWNLOADER_HOST");
        let jdownloader =
            (jd_host.is_some() || jd_credentials.is_some()).then(|| JDownloaderConfig {
                host: jd_host.unwrap_or_else(|| DEFAULT_JDOWNLOADER_HOST.to_string()),
                credentials: jd_credentials,
                device_id: get("JDOWNLOADER_DEVICE_ID"),
            });

        let drive = match (get("GDRIVE_FOLDER_ID"), get("GDRIVE_ACCESS_TOKEN")) {
            (Some(folder_id), Some(access_token)) => Some(DriveConfig {
                folder_id,
                access_token,
                team_drive: parse_bool(get("IS_TEAM_DRIVE")),
            }),
            _ => None,
        };

        Ok(Self {
            bot_token,
            download_dir: PathBuf::from(download_dir),
            status_interval,
            poll_interval,
            engine_setup_timeout,
            auto_delete,
            index_url: get("INDEX_URL").map(|url| url.trim_end_matches('/').to_string()),
            aria2,
            jdownloader,
            mega: credentials(get("MEGA_USERNAME"), get("MEGA_PASSWORD")),
            drive,
            extract_command: get("EXTRACT_COMMAND")
                .unwrap_or_else(|| DEFAULT_EXTRACT_COMMAND.to_string()),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

// Intervals drive `tokio::time::interval`, which rejects a zero period.
fn positive_secs(
    name: &'static str,
    value: Option<String>,
    default: u64,
) -> Result<Duration, ConfigError> {
    match parse_or(name, value, default)? {
        0 => Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn parse_bool(value: Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("true") | Some("TRUE") | Some("True"))
}

fn credentials(username: Option<String>, password: Option<String>) -> Option<Credentials> {
    match (username, password) {
        (Some(username), Some(password)) => Some(Credentials { username, password }),
        _ => None,
    }
}
