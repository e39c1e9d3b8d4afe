use std::{
    collections::HashSet,
    io::ErrorKind,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS, Transport};
use secrecy::ExposeSecret;
use tracing::{info, warn};

use climate_node_common::{
    apply_provisioned, CandidateConnector, ConnectionPolicy, DeviceConfig, JoinOutcome,
    Measurement, NetworkCandidate, NodeStatus, OverrideMode,
};

const CONFIG_PATH_ENV: &str = "CLIMATE_NODE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "climate-node.json";
const VISIBLE_SSIDS_ENV: &str = "SIMULATED_VISIBLE_SSIDS";

/// Desktop stand-in for the radio. Every candidate is reachable unless
/// `SIMULATED_VISIBLE_SSIDS` narrows the set.
struct SimulatedConnector {
    visible: Option<HashSet<String>>,
}

impl SimulatedConnector {
    fn from_env() -> Self {
        Self::new(std::env::var(VISIBLE_SSIDS_ENV).ok().as_deref())
    }

    /// `visible` is a comma separated SSID list; `None` makes every candidate reachable.
    fn new(visible: Option<&str>) -> Self {
        let visible = visible.map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        });
        Self { visible }
    }
}

impl CandidateConnector for SimulatedConnector {
    fn try_join(&mut self, candidate: &NetworkCandidate, _timeout: Duration) -> JoinOutcome {
        match &self.visible {
            Some(visible) if !visible.contains(&candidate.name) => JoinOutcome::TimedOut,
            _ => JoinOutcome::Joined,
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(load_config()?);
    info!(
        "device config loaded: {}",
        serde_json::to_string(&config.summary())?
    );
    if config.networks.is_empty() {
        warn!("no wifi networks configured; set WIFI_NETWORKS or list them in the config file");
    }

    let network = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            let mut connector = SimulatedConnector::from_env();
            ConnectionPolicy::default().run(&config.networks, &mut connector)
        })
        .await
        .context("wifi connection task panicked")?
        .context("wifi startup failed")?
    };
    info!("network `{}` adopted for this session", network.name);

    let offset = config
        .time
        .utc_offset()
        .context("time offsets do not form a valid UTC offset")?;
    info!(
        "clock offset {offset} (TZ={}, ntp server {} left to the host OS)",
        config.time.posix_tz(),
        config.time.ntp_server
    );

    let status_topic = config.broker.status_topic();
    let mut mqtt_options = MqttOptions::new(
        config.broker.client_id.clone(),
        config.broker.host.clone(),
        config.broker.port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_last_will(LastWill::new(
        status_topic.clone(),
        NodeStatus::Offline.as_str(),
        QoS::AtLeastOnce,
        true,
    ));

    if !config.broker.username.is_empty() {
        mqtt_options.set_credentials(
            config.broker.username.clone(),
            config.broker.password.expose_secret(),
        );
    }

    if config.broker.requires_tls() {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    info!("mqtt connected: {:?}", ack.code);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("node mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    mqtt.publish(
        status_topic.as_str(),
        QoS::AtLeastOnce,
        true,
        NodeStatus::Online.as_str(),
    )
    .await
    .context("failed to publish node online status")?;

    info!(
        "publishing to `{}` on {} every {}s",
        config.broker.topic,
        config.broker.url(),
        config.sensor.publish_interval_secs
    );

    let mut tick: u64 = 0;
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.sensor.publish_interval_secs));

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
        tick = tick.saturating_add(1);

        // No DHT11 on the host; cycle through plausible readings instead.
        let temperature_c = 21.0 + ((tick % 8) as f32 * 0.2);
        let humidity = 40.0 + ((tick % 6) as f32 * 0.5);

        let now = Utc::now().with_timezone(&offset);
        let measurement = Measurement::new(temperature_c, humidity, &now);
        let payload = measurement.to_json()?;

        mqtt.publish(config.broker.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .context("failed to publish measurement")?;
        info!(
            "published {:.1}°C / {:.1}% at {}",
            measurement.temperature, measurement.humidity, measurement.timestamp
        );
    }

    mqtt.publish(
        status_topic.as_str(),
        QoS::AtLeastOnce,
        true,
        NodeStatus::Offline.as_str(),
    )
    .await
    .context("failed to publish node offline status")?;
    if let Err(err) = mqtt.disconnect().await {
        warn!("mqtt disconnect failed: {err}");
    }

    Ok(())
}

fn load_config() -> anyhow::Result<DeviceConfig> {
    let path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = match std::fs::read_to_string(&path) {
        Ok(raw) => DeviceConfig::from_json(&raw)
            .with_context(|| format!("failed to load {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!("no config file at {}; using defaults", path.display());
            DeviceConfig::default()
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    apply_provisioned(&mut config, OverrideMode::Replace, |key| std::env::var(key).ok())
        .context("failed to apply environment overrides")?;
    config.sanitize();
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use climate_node_common::{CandidateList, ConnectError};

    use super::*;

    fn candidates() -> CandidateList {
        CandidateList::new(vec![
            NetworkCandidate::new("home-modem", "1"),
            NetworkCandidate::new("TP-Link_Home", "2"),
            NetworkCandidate::new("office", "3"),
        ])
    }

    #[test]
    fn visible_list_narrows_reachable_networks() {
        let mut connector = SimulatedConnector::new(Some(" office , TP-Link_Home"));
        let policy = ConnectionPolicy {
            max_rounds: 1,
            ..ConnectionPolicy::default()
        };

        let network = policy.run(&candidates(), &mut connector).unwrap();

        assert_eq!(network.name, "TP-Link_Home");
        assert_eq!(network.index, 1);
    }

    #[test]
    fn without_visible_list_first_candidate_joins() {
        let mut connector = SimulatedConnector::new(None);

        let network = ConnectionPolicy::default()
            .run(&candidates(), &mut connector)
            .unwrap();

        assert_eq!(network.index, 0);
    }

    #[test]
    fn nothing_visible_means_no_network() {
        let mut connector = SimulatedConnector::new(Some("neighbour"));
        let policy = ConnectionPolicy {
            max_rounds: 1,
            ..ConnectionPolicy::default()
        };

        assert!(matches!(
            policy.run(&candidates(), &mut connector),
            Err(ConnectError::NoNetworkAvailable { .. })
        ));
    }
}
