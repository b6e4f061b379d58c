//! Configuration file model.
//!
//! Grounded on `app/config.rs`'s `from_str` dispatch (JSON if the text
//! starts with `{`, YAML otherwise) and its
//! `#[serde(deny_unknown_fields, rename_all = "camelCase")]` style.

use std::io;
use std::net::SocketAddr;

use serde_json;
use serde_yaml;

use addr::Destination;
use router::Policy;

pub fn from_str(mut txt: &str) -> io::Result<Config> {
    txt = txt.trim_left();
    if txt.starts_with('{') {
        serde_json::from_str(txt).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    } else {
        serde_yaml::from_str(txt).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub top: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    pub control: Option<ControlConfig>,
    pub watchdog: Option<WatchdogConfig>,
}

fn default_threads() -> usize {
    1
}
fn default_max_conn() -> usize {
    usize::max_value()
}
fn default_interval_secs() -> u64 {
    2
}
fn default_buffer_size() -> usize {
    4096
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyConfig {
    Least,
    Round,
    Random,
    Source,
    Single,
}

impl Default for PolicyConfig {
    fn default() -> PolicyConfig {
        PolicyConfig::Least
    }
}

impl From<PolicyConfig> for Policy {
    fn from(p: PolicyConfig) -> Policy {
        match p {
            PolicyConfig::Least => Policy::Least,
            PolicyConfig::Round => Policy::Round,
            PolicyConfig::Random => Policy::Random,
            PolicyConfig::Source => Policy::Source,
            PolicyConfig::Single => Policy::Single,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub addr: SocketAddr,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl From<DestinationConfig> for Destination {
    fn from(d: DestinationConfig) -> Destination {
        Destination::new(d.addr, d.weight)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ControlConfig {
    pub tcp_addr: Option<SocketAddr>,
    pub fifo_path: Option<String>,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

fn default_max_clients() -> usize {
    32
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct WatchdogConfig {
    pub probe_command: Option<Vec<String>>,
    #[serde(default = "default_latency_samples")]
    pub latency_samples: u32,
    #[serde(default = "default_extra_interval_secs")]
    pub extra_interval_secs: u64,
    #[serde(default)]
    pub discover_cluster: bool,
}

fn default_latency_samples() -> u32 {
    0
}
fn default_extra_interval_secs() -> u64 {
    1
}
