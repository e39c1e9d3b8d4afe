use chrono::FixedOffset;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::secret;

pub const MQTT_TLS_PORT: u16 = 8883;

// ESP-IDF station config stores these in fixed-size buffers.
const MAX_SSID_BYTES: usize = 32;
const MAX_PASSPHRASE_BYTES: usize = 64;

// chrono::FixedOffset rejects anything at or beyond a full day.
const MAX_OFFSET_SEC: i32 = 86_399;

const MEASUREMENTS_COLLECTION: &str = "measurements";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("wifi_network_count is {declared} but {actual} network(s) are listed")]
    Inconsistency { declared: usize, actual: usize },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("malformed configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid provisioning value: {0}")]
    Provisioning(String),
}

/// One access point the device may join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkCandidate {
    pub name: String,
    #[serde(with = "secret", default = "secret::empty")]
    pub secret: SecretString,
}

impl NetworkCandidate {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: SecretString::from(secret.into()),
        }
    }

    pub fn is_open(&self) -> bool {
        !secret::is_set(&self.secret)
    }
}

/// Networks in connection priority order. Duplicates are kept.
///
/// The count is always read from the underlying vector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateList(Vec<NetworkCandidate>);

impl CandidateList {
    pub fn new(candidates: Vec<NetworkCandidate>) -> Self {
        Self(candidates)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&NetworkCandidate> {
        self.0.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NetworkCandidate> {
        self.0.iter()
    }
}

impl FromIterator<NetworkCandidate> for CandidateList {
    fn from_iter<I: IntoIterator<Item = NetworkCandidate>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a CandidateList {
    type Item = &'a NetworkCandidate;
    type IntoIter = std::slice::Iter<'a, NetworkCandidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    pub username: String,
    #[serde(with = "secret")]
    pub password: SecretString,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: MQTT_TLS_PORT,
            client_id: "ESP32-DHT11".to_string(),
            topic: "esp32/dht11".to_string(),
            username: String::new(),
            password: secret::empty(),
        }
    }
}

impl BrokerConfig {
    pub fn requires_tls(&self) -> bool {
        self.port == MQTT_TLS_PORT
    }

    pub fn url(&self) -> String {
        let scheme = if self.requires_tls() { "mqtts" } else { "mqtt" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Retained online/offline marker published next to the data topic.
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.topic.trim_end_matches('/'))
    }

    fn collect_issues(&self, issues: &mut Vec<String>) {
        if self.host.trim().is_empty() {
            issues.push("broker.host cannot be empty".to_string());
        }
        if self.port == 0 {
            issues.push("broker.port must be between 1 and 65535".to_string());
        }
        if self.client_id.trim().is_empty() {
            issues.push("broker.client_id cannot be empty".to_string());
        }
        if self.topic.trim().is_empty() {
            issues.push("broker.topic cannot be empty".to_string());
        }
        if self.topic.contains(&['+', '#'][..]) {
            issues.push("broker.topic cannot contain wildcards".to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSyncConfig {
    pub ntp_server: String,
    pub gmt_offset_sec: i32,
    pub daylight_offset_sec: i32,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            ntp_server: "pool.ntp.org".to_string(),
            gmt_offset_sec: 2 * 3600,
            daylight_offset_sec: 0,
        }
    }
}

impl TimeSyncConfig {
    /// Wall-clock offset with daylight saving applied, if it is a valid offset.
    pub fn utc_offset(&self) -> Option<FixedOffset> {
        let total = self.gmt_offset_sec.checked_add(self.daylight_offset_sec)?;
        FixedOffset::east_opt(total)
    }

    /// POSIX `TZ` value for the C library (offsets in POSIX count westward).
    pub fn posix_tz(&self) -> String {
        let mut tz = format!("UTC{}", posix_offset(self.gmt_offset_sec));
        if self.daylight_offset_sec != 0 {
            tz.push_str("DST");
            tz.push_str(&posix_offset(
                self.gmt_offset_sec.saturating_add(self.daylight_offset_sec),
            ));
        }
        tz
    }

    fn collect_issues(&self, issues: &mut Vec<String>) {
        if self.ntp_server.trim().is_empty() {
            issues.push("time.ntp_server cannot be empty".to_string());
        }
        let valid_range = -MAX_OFFSET_SEC..=MAX_OFFSET_SEC;
        let gmt_ok = valid_range.contains(&self.gmt_offset_sec);
        let daylight_ok = valid_range.contains(&self.daylight_offset_sec);
        if !gmt_ok {
            issues.push(format!(
                "time.gmt_offset_sec {} is outside +/-{MAX_OFFSET_SEC}",
                self.gmt_offset_sec
            ));
        }
        if !daylight_ok {
            issues.push(format!(
                "time.daylight_offset_sec {} is outside +/-{MAX_OFFSET_SEC}",
                self.daylight_offset_sec
            ));
        }
        if gmt_ok && daylight_ok && self.utc_offset().is_none() {
            issues.push("time offsets add up to more than a day".to_string());
        }
    }
}

fn posix_offset(east_sec: i32) -> String {
    let sign = if east_sec > 0 { '-' } else { '+' };
    let abs = east_sec.unsigned_abs();
    format!(
        "{sign}{}:{:02}:{:02}",
        abs / 3600,
        (abs % 3600) / 60,
        abs % 60
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteDatabaseConfig {
    pub host: String,
    #[serde(with = "secret")]
    pub auth: SecretString,
}

impl Default for RemoteDatabaseConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            auth: secret::empty(),
        }
    }
}

impl RemoteDatabaseConfig {
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty()
    }

    /// REST address of a collection, e.g. `measurements`. The auth token
    /// is sent separately and never appears here.
    pub fn collection_url(&self, path: &str) -> String {
        format!(
            "https://{}/{}.json",
            self.host.trim().trim_end_matches('/'),
            path.trim_matches('/')
        )
    }

    fn collect_issues(&self, issues: &mut Vec<String>) {
        let host = self.host.trim();
        if host.starts_with("http://") || host.starts_with("https://") {
            issues.push("database.host must not include a scheme".to_string());
        } else if host.contains('/') {
            issues.push("database.host must be a bare hostname".to_string());
        }
        if !self.is_configured() && secret::is_set(&self.auth) {
            issues.push("database.auth is set but database.host is empty".to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub publish_interval_secs: u64,
    pub dht_pin: i32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            publish_interval_secs: 30,
            dht_pin: 4,
        }
    }
}

impl SensorConfig {
    pub fn sanitize(&mut self) {
        self.publish_interval_secs = self.publish_interval_secs.clamp(5, 3_600);
        if self.dht_pin < 0 {
            self.dht_pin = 4;
        }
    }
}

/// Process-wide device configuration. Loaded once, then shared read-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub networks: CandidateList,
    pub broker: BrokerConfig,
    pub time: TimeSyncConfig,
    pub database: RemoteDatabaseConfig,
    pub sensor: SensorConfig,
}

#[derive(Deserialize)]
struct DeviceConfigDocument {
    #[serde(flatten)]
    config: DeviceConfig,
    #[serde(default, alias = "wifiNetworkCount")]
    wifi_network_count: Option<usize>,
}

impl DeviceConfig {
    /// Parses a config document. A leftover `wifi_network_count` must match the list.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let document: DeviceConfigDocument = serde_json::from_str(raw)?;
        let actual = document.config.networks.len();

        match document.wifi_network_count {
            Some(declared) if declared != actual => {
                Err(ConfigError::Inconsistency { declared, actual })
            }
            _ => Ok(document.config),
        }
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn sanitize(&mut self) {
        self.sensor.sanitize();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        for (index, candidate) in self.networks.iter().enumerate() {
            if candidate.name.trim().is_empty() {
                issues.push(format!("networks[{index}].name cannot be empty"));
            }
            if candidate.name.len() > MAX_SSID_BYTES {
                issues.push(format!(
                    "networks[{index}].name exceeds {MAX_SSID_BYTES} bytes"
                ));
            }
            if candidate.secret.expose_secret().len() > MAX_PASSPHRASE_BYTES {
                issues.push(format!(
                    "networks[{index}].secret exceeds {MAX_PASSPHRASE_BYTES} bytes"
                ));
            }
        }

        self.broker.collect_issues(&mut issues);
        self.time.collect_issues(&mut issues);
        self.database.collect_issues(&mut issues);

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }

    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            networks: self.networks.iter().map(|c| c.name.clone()).collect(),
            network_count: self.networks.len(),
            broker_url: self.broker.url(),
            client_id: self.broker.client_id.clone(),
            topic: self.broker.topic.clone(),
            broker_user: self.broker.username.clone(),
            broker_pass_set: secret::is_set(&self.broker.password),
            ntp_server: self.time.ntp_server.clone(),
            posix_tz: self.time.posix_tz(),
            database_url: self
                .database
                .is_configured()
                .then(|| self.database.collection_url(MEASUREMENTS_COLLECTION)),
            database_auth_set: secret::is_set(&self.database.auth),
            publish_interval_secs: self.sensor.publish_interval_secs,
        }
    }
}

/// Loggable view of a [`DeviceConfig`] with every secret reduced to a flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSummary {
    pub networks: Vec<String>,
    #[serde(rename = "networkCount")]
    pub network_count: usize,
    #[serde(rename = "brokerUrl")]
    pub broker_url: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub topic: String,
    #[serde(rename = "brokerUser")]
    pub broker_user: String,
    #[serde(rename = "brokerPassSet")]
    pub broker_pass_set: bool,
    #[serde(rename = "ntpServer")]
    pub ntp_server: String,
    #[serde(rename = "posixTz")]
    pub posix_tz: String,
    #[serde(rename = "databaseUrl")]
    pub database_url: Option<String>,
    #[serde(rename = "databaseAuthSet")]
    pub database_auth_set: bool,
    #[serde(rename = "publishIntervalSecs")]
    pub publish_interval_secs: u64,
}
