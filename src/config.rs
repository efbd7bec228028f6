//! Transfer configuration read from an external configuration store.
//!
//! Parsing `.gitconfig` files is someone else's job; this module only needs
//! a key/value view of the merged configuration ([`ConfigSource`]).

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::{Direction, Error, Result};

/// Default number of parallel transfers.
pub const DEFAULT_CONCURRENT_TRANSFERS: usize = 8;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(1800);
const DEFAULT_TLS_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only key/value view of configuration (git config or environment).
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;

    /// Every key/value pair.
    fn all(&self) -> Vec<(String, String)>;

    /// Parse a git-style boolean, falling back to `default` when the key is
    /// missing or unparsable.
    fn bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .and_then(|v| parse_bool(&v))
            .unwrap_or(default)
    }

    fn int(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}

impl ConfigSource for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }

    fn all(&self) -> Vec<(String, String)> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }

    fn all(&self) -> Vec<(String, String)> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEnvironment;

impl ConfigSource for OsEnvironment {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn all(&self) -> Vec<(String, String)> {
        std::env::vars().collect()
    }
}

/// Git's boolean spellings.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "" | "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Which registry slots a custom adapter is installed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterDirections {
    Download,
    Upload,
    Both,
}

impl AdapterDirections {
    pub fn includes(&self, direction: Direction) -> bool {
        match self {
            AdapterDirections::Both => true,
            AdapterDirections::Download => direction == Direction::Download,
            AdapterDirections::Upload => direction == Direction::Upload,
        }
    }
}

impl std::str::FromStr for AdapterDirections {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "both" => Ok(AdapterDirections::Both),
            "download" => Ok(AdapterDirections::Download),
            "upload" => Ok(AdapterDirections::Upload),
            other => Err(Error::Config(format!("invalid direction {other:?}"))),
        }
    }
}

/// An external transfer program configured under
/// `transfer.customtransfer.<name>.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomAdapterConfig {
    pub name: String,
    pub path: String,
    pub args: String,
    /// Whether one process per worker may run; `false` forces one worker.
    pub concurrent: bool,
    pub direction: AdapterDirections,
}

/// Timeouts for the HTTP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpConfig {
    pub dial_timeout: Duration,
    pub keepalive: Duration,
    pub tls_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            keepalive: DEFAULT_KEEPALIVE,
            tls_timeout: DEFAULT_TLS_TIMEOUT,
        }
    }
}

/// Everything the transfer engine reads from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    pub concurrent_transfers: usize,
    pub basic_transfers_only: bool,
    pub http: HttpConfig,
    pub custom_adapters: Vec<CustomAdapterConfig>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            concurrent_transfers: DEFAULT_CONCURRENT_TRANSFERS,
            basic_transfers_only: false,
            http: HttpConfig::default(),
            custom_adapters: Vec::new(),
        }
    }
}

impl TransferConfig {
    pub fn from_source(cfg: &dyn ConfigSource) -> Self {
        let concurrent_transfers = match cfg.int("lfs.concurrenttransfers", 0) {
            n if n > 0 => n as usize,
            _ => DEFAULT_CONCURRENT_TRANSFERS,
        };

        TransferConfig {
            concurrent_transfers,
            basic_transfers_only: cfg.bool("lfs.basictransfersonly", false),
            http: HttpConfig {
                dial_timeout: seconds(cfg, "lfs.dialtimeout", DEFAULT_DIAL_TIMEOUT),
                keepalive: seconds(cfg, "lfs.keepalive", DEFAULT_KEEPALIVE),
                tls_timeout: seconds(cfg, "lfs.tlstimeout", DEFAULT_TLS_TIMEOUT),
            },
            custom_adapters: custom_adapters(cfg),
        }
    }
}

fn seconds(cfg: &dyn ConfigSource, key: &str, default: Duration) -> Duration {
    match cfg.int(key, 0) {
        n if n > 0 => Duration::from_secs(n as u64),
        _ => default,
    }
}

/// Scan for `*.customtransfer.<name>.path` keys. Malformed entries are
/// skipped with a warning.
pub fn custom_adapters(cfg: &dyn ConfigSource) -> Vec<CustomAdapterConfig> {
    let path_key = match Regex::new(r"^(transfer|lfs)\.customtransfer\.([^.]+)\.path$") {
        Ok(re) => re,
        Err(e) => {
            tracing::warn!("custom transfer key pattern: {}", e);
            return Vec::new();
        }
    };

    let mut found: Vec<CustomAdapterConfig> = Vec::new();
    let mut entries = cfg.all();
    entries.sort();
    for (key, path) in entries {
        let Some(caps) = path_key.captures(&key) else {
            continue;
        };
        let prefix = format!("{}.customtransfer.{}", &caps[1], &caps[2]);
        match custom_adapter(cfg, &caps[2], &prefix, &path) {
            Ok(adapter) => {
                if let Some(existing) = found.iter_mut().find(|a| a.name == adapter.name) {
                    // The `transfer.` spelling wins over the historical `lfs.` one.
                    if &caps[1] == "transfer" {
                        *existing = adapter;
                    }
                } else {
                    found.push(adapter);
                }
            }
            Err(e) => tracing::warn!("skipping custom transfer adapter {:?}: {}", &caps[2], e),
        }
    }
    found
}

fn custom_adapter(cfg: &dyn ConfigSource, name: &str, prefix: &str, path: &str) -> Result<CustomAdapterConfig> {
    let path = path.trim();
    if path.is_empty() {
        return Err(Error::Config(format!("{prefix}.path is empty")));
    }

    let concurrent = match cfg.get(&format!("{prefix}.concurrent")) {
        None => true,
        Some(v) => parse_bool(&v)
            .ok_or_else(|| Error::Config(format!("{prefix}.concurrent is not a boolean: {v:?}")))?,
    };

    let direction = cfg
        .get(&format!("{prefix}.direction"))
        .unwrap_or_default()
        .parse()?;

    Ok(CustomAdapterConfig {
        name: name.to_string(),
        path: path.to_string(),
        args: cfg.get(&format!("{prefix}.args")).unwrap_or_default(),
        concurrent,
        direction,
    })
}
