use std::{path::PathBuf, sync::LazyLock, time::Duration};

use reqwest::Url;
use serde::{
    de::{DeserializeOwned, Error},
    Deserialize, Deserializer,
};
use tracing::error;

use crate::{alerts::telegram::TELEGRAM_API_URL, monitor::MonitorConfig, sweep::SweepConfig};

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub telegram_api_key: String,
    #[serde(
        default = "default_telegram_api_url",
        deserialize_with = "deserialize_url"
    )]
    pub telegram_api_url: Url,
    /// Without a key the explorer fallback is disabled.
    pub explorer_api_key: Option<String>,
    #[serde(default = "default_explorer_url", deserialize_with = "deserialize_url")]
    pub explorer_url: Url,
    pub explorer_chain_id: Option<u64>,
    #[serde(default = "default_rpc_urls", deserialize_with = "deserialize_urls")]
    pub rpc_urls: Vec<Url>,
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_check_interval_minutes")]
    pub check_interval_minutes: u64,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_max_rounds", deserialize_with = "deserialize_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_base_wait_seconds")]
    pub base_wait_seconds: u64,
    #[serde(default = "default_cap_wait_seconds")]
    pub cap_wait_seconds: u64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_alert_cooldown_hours")]
    pub alert_cooldown_hours: i64,
}

fn default_telegram_api_url() -> Url {
    Url::parse(TELEGRAM_API_URL).expect("valid default telegram url")
}

fn default_explorer_url() -> Url {
    Url::parse("https://api.bscscan.com/api").expect("valid default explorer url")
}

fn default_rpc_urls() -> Vec<Url> {
    (1..=4)
        .map(|n| {
            Url::parse(&format!("https://bsc-dataseed{}.binance.org", n))
                .expect("valid default rpc url")
        })
        .collect()
}

fn default_data_file() -> PathBuf {
    PathBuf::from("user_data.json")
}

fn default_port() -> u16 {
    3002
}

fn default_check_interval_minutes() -> u64 {
    30
}

fn default_request_delay_ms() -> u64 {
    300
}

fn default_max_rounds() -> u32 {
    10
}

fn default_base_wait_seconds() -> u64 {
    2
}

fn default_cap_wait_seconds() -> u64 {
    10
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_alert_cooldown_hours() -> i64 {
    24
}

impl AppConfig {
    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            max_rounds: self.max_rounds,
            base_wait: Duration::from_secs(self.base_wait_seconds),
            cap_wait: Duration::from_secs(self.cap_wait_seconds),
            request_delay: Duration::from_millis(self.request_delay_ms),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.check_interval_minutes * 60),
            cooldown: chrono::Duration::hours(self.alert_cooldown_hours),
            sweep: self.sweep_config(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

pub fn deserialize_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(s.trim()).map_err(Error::custom)
}

/// Deserialize a comma separated list of urls, ignoring surrounding whitespace.
pub fn deserialize_urls<'de, D>(deserializer: D) -> Result<Vec<Url>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    let urls = s
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Url::parse(s).map_err(Error::custom))
        .collect::<Result<Vec<_>, _>>()?;

    if urls.is_empty() {
        return Err(Error::custom("expected at least one url"));
    }
    Ok(urls)
}

/// A sweep needs at least one round to query anything.
fn deserialize_rounds<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match u32::deserialize(deserializer)? {
        0 => Err(Error::custom("max rounds must be at least 1")),
        rounds => Ok(rounds),
    }
}

pub fn get_app_config<T: DeserializeOwned>() -> T {
    match envy::from_env::<T>() {
        Ok(config) => config,
        Err(err) => {
            error!("failed to parse config: {}", err);
            std::process::exit(1);
        }
    }
}

pub static APP_CONFIG: LazyLock<AppConfig> = LazyLock::new(get_app_config);
