//! Credentials supplied outside the config document.
//!
//! Host builds read these from the process environment at startup; device
//! builds bake them in with `option_env!` and only use them to fill gaps
//! left by the NVS copy.

use secrecy::SecretString;

use crate::{
    config::{CandidateList, ConfigError, DeviceConfig, NetworkCandidate},
    secret,
};

pub const ENV_WIFI_NETWORKS: &str = "WIFI_NETWORKS";
pub const ENV_MQTT_HOST: &str = "MQTT_HOST";
pub const ENV_MQTT_PORT: &str = "MQTT_PORT";
pub const ENV_MQTT_USER: &str = "MQTT_USER";
pub const ENV_MQTT_PASS: &str = "MQTT_PASS";
pub const ENV_MQTT_CLIENT_ID: &str = "MQTT_CLIENT_ID";
pub const ENV_MQTT_TOPIC: &str = "MQTT_TOPIC";
pub const ENV_NTP_SERVER: &str = "NTP_SERVER";
pub const ENV_GMT_OFFSET_SEC: &str = "GMT_OFFSET_SEC";
pub const ENV_DAYLIGHT_OFFSET_SEC: &str = "DAYLIGHT_OFFSET_SEC";
pub const ENV_FIREBASE_HOST: &str = "FIREBASE_HOST";
pub const ENV_FIREBASE_AUTH: &str = "FIREBASE_AUTH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideMode {
    /// Provisioned values win over the document.
    Replace,
    /// Provisioned values only fill empty fields.
    FillEmpty,
}

/// Parses `name=secret;name2=secret2`. The first `=` splits an entry, so
/// secrets may contain `=`. An entry without `=` is an open network.
pub fn parse_network_list(raw: &str) -> Result<CandidateList, ConfigError> {
    let mut candidates = Vec::new();

    for (index, entry) in raw.split(';').enumerate() {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (name, secret) = entry.split_once('=').unwrap_or((entry, ""));
        if name.trim().is_empty() {
            return Err(ConfigError::Provisioning(format!(
                "{ENV_WIFI_NETWORKS} entry {index} has no network name"
            )));
        }

        candidates.push(NetworkCandidate::new(name.trim(), secret));
    }

    Ok(CandidateList::new(candidates))
}

pub fn apply_provisioned<F>(
    config: &mut DeviceConfig,
    mode: OverrideMode,
    lookup: F,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(raw) = value(ENV_WIFI_NETWORKS) {
        if mode == OverrideMode::Replace || config.networks.is_empty() {
            config.networks = parse_network_list(&raw)?;
        }
    }

    if let Some(host) = value(ENV_MQTT_HOST) {
        set_string(&mut config.broker.host, host, mode);
    }

    // Numeric fields always hold a value, so only Replace can change them.
    if let Some(port) = value(ENV_MQTT_PORT) {
        let port = port
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                ConfigError::Provisioning(format!(
                    "{ENV_MQTT_PORT} must be between 1 and 65535, got `{port}`"
                ))
            })?;
        if mode == OverrideMode::Replace {
            config.broker.port = port;
        }
    }

    if let Some(client_id) = value(ENV_MQTT_CLIENT_ID) {
        set_string(&mut config.broker.client_id, client_id, mode);
    }

    if let Some(topic) = value(ENV_MQTT_TOPIC) {
        set_string(&mut config.broker.topic, topic, mode);
    }

    if let Some(server) = value(ENV_NTP_SERVER) {
        set_string(&mut config.time.ntp_server, server, mode);
    }

    if let Some(raw) = value(ENV_GMT_OFFSET_SEC) {
        let offset = parse_offset(ENV_GMT_OFFSET_SEC, &raw)?;
        if mode == OverrideMode::Replace {
            config.time.gmt_offset_sec = offset;
        }
    }

    if let Some(raw) = value(ENV_DAYLIGHT_OFFSET_SEC) {
        let offset = parse_offset(ENV_DAYLIGHT_OFFSET_SEC, &raw)?;
        if mode == OverrideMode::Replace {
            config.time.daylight_offset_sec = offset;
        }
    }

    if let Some(user) = value(ENV_MQTT_USER) {
        set_string(&mut config.broker.username, user, mode);
    }

    if let Some(pass) = value(ENV_MQTT_PASS) {
        set_secret(&mut config.broker.password, pass, mode);
    }

    if let Some(host) = value(ENV_FIREBASE_HOST) {
        set_string(&mut config.database.host, host, mode);
    }

    if let Some(auth) = value(ENV_FIREBASE_AUTH) {
        set_secret(&mut config.database.auth, auth, mode);
    }

    Ok(())
}

/// Builds the device config from its stored copy, if any. A stored document
/// only has gaps filled; a fresh device takes every provisioned value.
pub fn seed_device_config<F>(
    stored: Option<DeviceConfig>,
    lookup: F,
) -> Result<DeviceConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let (mut config, mode) = match stored {
        Some(config) => (config, OverrideMode::FillEmpty),
        None => (DeviceConfig::default(), OverrideMode::Replace),
    };
    apply_provisioned(&mut config, mode, lookup)?;
    Ok(config)
}

fn parse_offset(key: &str, raw: &str) -> Result<i32, ConfigError> {
    raw.trim().parse::<i32>().map_err(|_| {
        ConfigError::Provisioning(format!(
            "{key} must be a whole number of seconds, got `{raw}`"
        ))
    })
}

fn set_string(field: &mut String, value: String, mode: OverrideMode) {
    if mode == OverrideMode::Replace || field.trim().is_empty() {
        *field = value.trim().to_string();
    }
}

fn set_secret(field: &mut SecretString, value: String, mode: OverrideMode) {
    if mode == OverrideMode::Replace || !secret::is_set(field) {
        *field = SecretString::from(value);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn network_list_keeps_order_and_duplicates() {
        let list = parse_network_list("home=one;office=two;home=one").unwrap();
        let names: Vec<_> = list.iter().map(|c| c.name.as_str()).collect();

        assert_eq!(names, vec!["home", "office", "home"]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn network_secret_may_contain_equals() {
        let list = parse_network_list(" lab = a=b=c ; ").unwrap();
        let candidate = list.get(0).unwrap();

        assert_eq!(list.len(), 1);
        assert_eq!(candidate.name, "lab");
        assert_eq!(candidate.secret.expose_secret(), " a=b=c");
    }

    #[test]
    fn entry_without_secret_is_open() {
        let list = parse_network_list("cafe;guest=").unwrap();

        assert!(list.iter().all(NetworkCandidate::is_open));
    }

    #[test]
    fn entry_without_name_is_rejected() {
        assert!(matches!(
            parse_network_list("home=1;=orphan"),
            Err(ConfigError::Provisioning(_))
        ));
    }

    #[test]
    fn replace_mode_overrides_document() {
        let vars = env(&[
            (ENV_WIFI_NETWORKS, "a=1;b=2"),
            (ENV_MQTT_HOST, "broker.local"),
            (ENV_MQTT_PORT, "1883"),
            (ENV_MQTT_PASS, "pw"),
            (ENV_FIREBASE_AUTH, "token"),
        ]);
        let mut config = DeviceConfig::default();
        config.broker.host = "old.example".to_string();

        apply_provisioned(&mut config, OverrideMode::Replace, |k| vars.get(k).cloned())
            .unwrap();

        assert_eq!(config.networks.len(), 2);
        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.password.expose_secret(), "pw");
        assert_eq!(config.database.auth.expose_secret(), "token");
    }

    #[test]
    fn fill_mode_keeps_stored_values() {
        let vars = env(&[
            (ENV_WIFI_NETWORKS, "fallback=1"),
            (ENV_MQTT_HOST, "broker.local"),
            (ENV_MQTT_USER, "node"),
            (ENV_MQTT_PORT, "1883"),
        ]);
        let mut config = DeviceConfig::default();
        config.networks = CandidateList::new(vec![NetworkCandidate::new("stored", "x")]);
        config.broker.host = "stored.example".to_string();

        apply_provisioned(&mut config, OverrideMode::FillEmpty, |k| vars.get(k).cloned())
            .unwrap();

        assert_eq!(config.networks.get(0).unwrap().name, "stored");
        assert_eq!(config.broker.host, "stored.example");
        assert_eq!(config.broker.username, "node");
        assert_eq!(config.broker.port, 8883);
    }

    #[test]
    fn bad_port_is_rejected() {
        let vars = env(&[(ENV_MQTT_PORT, "70000")]);
        let mut config = DeviceConfig::default();

        let result =
            apply_provisioned(&mut config, OverrideMode::Replace, |k| vars.get(k).cloned());

        assert!(matches!(result, Err(ConfigError::Provisioning(_))));
        assert_eq!(config.broker.port, 8883);
    }

    #[test]
    fn time_and_topic_keys_replace_defaults() {
        let vars = env(&[
            (ENV_MQTT_CLIENT_ID, "greenhouse-1"),
            (ENV_MQTT_TOPIC, "greenhouse/climate"),
            (ENV_NTP_SERVER, "time.nist.gov"),
            (ENV_GMT_OFFSET_SEC, "-18000"),
            (ENV_DAYLIGHT_OFFSET_SEC, "0"),
        ]);
        let mut config = DeviceConfig::default();

        apply_provisioned(&mut config, OverrideMode::Replace, |k| vars.get(k).cloned())
            .unwrap();

        assert_eq!(config.broker.client_id, "greenhouse-1");
        assert_eq!(config.broker.topic, "greenhouse/climate");
        assert_eq!(config.time.ntp_server, "time.nist.gov");
        assert_eq!(config.time.gmt_offset_sec, -18000);
        assert_eq!(config.time.daylight_offset_sec, 0);
    }

    #[test]
    fn malformed_offset_is_rejected() {
        let vars = env(&[(ENV_GMT_OFFSET_SEC, "+2h")]);
        let mut config = DeviceConfig::default();

        let result =
            apply_provisioned(&mut config, OverrideMode::Replace, |k| vars.get(k).cloned());

        assert!(matches!(result, Err(ConfigError::Provisioning(_))));
        assert_eq!(config.time.gmt_offset_sec, 7200);
    }

    #[test]
    fn fresh_device_takes_every_provisioned_value() {
        let vars = env(&[
            (ENV_WIFI_NETWORKS, "home=1"),
            (ENV_MQTT_PORT, "1883"),
            (ENV_GMT_OFFSET_SEC, "-3600"),
        ]);

        let config = seed_device_config(None, |k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.networks.len(), 1);
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.time.gmt_offset_sec, -3600);
    }

    #[test]
    fn stored_device_config_keeps_its_numbers() {
        let vars = env(&[(ENV_MQTT_PORT, "1883"), (ENV_MQTT_USER, "node")]);
        let mut stored = DeviceConfig::default();
        stored.broker.port = 8884;

        let config = seed_device_config(Some(stored), |k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.broker.port, 8884);
        assert_eq!(config.broker.username, "node");
    }
}
