use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use dht_sensor::dht11;
use embedded_svc::{
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    log::EspLogger,
    mqtt::client::{
        EspMqttClient, EspMqttConnection, EventPayload, LwtConfiguration, MqttClientConfiguration,
    },
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SntpConf, SyncStatus},
    wifi::EspWifi,
};
use log::{info, warn};
use secrecy::ExposeSecret;

use climate_node_common::{
    provision::{
        ENV_DAYLIGHT_OFFSET_SEC, ENV_FIREBASE_AUTH, ENV_FIREBASE_HOST, ENV_GMT_OFFSET_SEC,
        ENV_MQTT_CLIENT_ID, ENV_MQTT_HOST, ENV_MQTT_PASS, ENV_MQTT_PORT, ENV_MQTT_TOPIC,
        ENV_MQTT_USER, ENV_NTP_SERVER, ENV_WIFI_NETWORKS,
    },
    secret, seed_device_config, CandidateConnector, ConnectionPolicy, DeviceConfig, JoinOutcome,
    Measurement, NetworkCandidate, NodeStatus,
};

const NVS_NAMESPACE: &str = "climate";
const NVS_CONFIG_KEY: &str = "device_json";

const STATUS_LED_PIN: i32 = 2;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_POLL_INTERVAL_MS: u64 = 200;
const NO_NETWORK_RESTART_DELAY_MS: u64 = 60_000;
const LED_FAST_BLINK_MS: u64 = 150;
const SNTP_SYNC_WAIT_SEC: u64 = 30;

struct ClimateSensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    gpio: i32,
    delay: Ets,
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// Joins candidates on the station interface, one at a time.
struct EspConnector<'a> {
    wifi: &'a mut EspWifi<'static>,
}

impl CandidateConnector for EspConnector<'_> {
    fn try_join(&mut self, candidate: &NetworkCandidate, timeout: Duration) -> JoinOutcome {
        match self.join(candidate, timeout) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    "wifi driver error while joining `{}`: {err:#}",
                    candidate.name
                );
                JoinOutcome::Rejected
            }
        }
    }
}

impl EspConnector<'_> {
    fn join(
        &mut self,
        candidate: &NetworkCandidate,
        timeout: Duration,
    ) -> anyhow::Result<JoinOutcome> {
        if self.wifi.is_connected()? {
            if let Err(err) = self.wifi.disconnect() {
                warn!("wifi disconnect before joining `{}` failed: {err}", candidate.name);
            }
        }

        let auth_method = if candidate.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: candidate
                    .name
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi ssid too long"))?,
                password: candidate
                    .secret
                    .expose_secret()
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;

        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }

        if let Err(err) = self.wifi.connect() {
            warn!("wifi connect to `{}` refused: {err}", candidate.name);
            return Ok(JoinOutcome::Rejected);
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.wifi.is_up()? {
                return Ok(JoinOutcome::Joined);
            }
            thread::sleep(Duration::from_millis(WIFI_POLL_INTERVAL_MS));
        }

        if let Err(err) = self.wifi.disconnect() {
            warn!("wifi disconnect after `{}` timed out failed: {err}", candidate.name);
        }
        Ok(JoinOutcome::TimedOut)
    }
}

impl ClimateSensor {
    fn new(gpio: i32) -> anyhow::Result<Self> {
        let pin = unsafe { AnyIOPin::new(gpio) };
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;

        Ok(Self {
            pin,
            gpio,
            delay: Ets,
        })
    }

    /// Returns `(temperature_c, humidity_pct)`.
    fn read(&mut self) -> Option<(f32, f32)> {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to set DHT11 line high before read: {err:?}");
            return None;
        }

        match dht11::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => {
                let temperature = reading.temperature as f32;
                let humidity = reading.relative_humidity as f32;
                info!("[DHT11] {:.1}°C / {:.1}%", temperature, humidity);
                Some((temperature, humidity))
            }
            Err(err) => {
                warn!("failed to read DHT11 on GPIO{}: {err:?}", self.gpio);
                None
            }
        }
    }
}

impl StatusLed {
    fn set(&mut self, on: bool) {
        if on == self.lit {
            return;
        }

        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };

        match result {
            Ok(()) => self.lit = on,
            Err(err) => warn!("failed to drive status LED: {err}"),
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let config = Arc::new(load_device_config(&nvs_store)?);
    info!(
        "device config loaded: {}",
        serde_json::to_string(&config.summary())?
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let mut status_led = init_status_led(STATUS_LED_PIN);
    let mut sensor = ClimateSensor::new(config.sensor.dht_pin)
        .context("failed to initialize DHT11 sensor")?;

    let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
    let joined = {
        let mut connector = EspConnector { wifi: &mut wifi };
        ConnectionPolicy::default().run(&config.networks, &mut connector)
    };
    let network = match joined {
        Ok(network) => network,
        Err(err) => {
            warn!(
                "{err}; restarting in {}s to retry the network list",
                NO_NETWORK_RESTART_DELAY_MS / 1000
            );
            restart_after_no_network(&mut status_led);
        }
    };
    info!(
        "wifi session adopted `{}` (candidate {} of {})",
        network.name,
        network.index + 1,
        config.networks.len()
    );
    disable_wifi_power_save();
    if let Some(led) = status_led.as_mut() {
        led.set(true);
    }

    std::env::set_var("TZ", config.time.posix_tz());
    unsafe { esp_idf_svc::sys::tzset() };

    let mut sntp_conf = SntpConf::default();
    sntp_conf.servers[0] = config.time.ntp_server.as_str();
    let sntp = EspSntp::new(&sntp_conf).context("failed to start SNTP")?;
    info!("SNTP started against `{}`", config.time.ntp_server);

    let sync_started = Instant::now();
    while sntp.get_sync_status() != SyncStatus::Completed {
        if sync_started.elapsed() >= Duration::from_secs(SNTP_SYNC_WAIT_SEC) {
            warn!("SNTP not synced after {SNTP_SYNC_WAIT_SEC}s; timestamps stay unreliable until it is");
            break;
        }
        thread::sleep(Duration::from_millis(500));
    }
    if sntp.get_sync_status() == SyncStatus::Completed {
        info!("clock synced: {}", Utc::now());
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let offset = config
        .time
        .utc_offset()
        .ok_or_else(|| anyhow!("time offsets do not form a valid UTC offset"))?;

    let status_topic = config.broker.status_topic();
    let (mut mqtt, mut conn) = create_mqtt_client(&config, &status_topic)?;

    thread::Builder::new()
        .name("mqtt-poll".to_string())
        .stack_size(8192)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => info!("mqtt connected"),
                    EventPayload::Disconnected => warn!("mqtt disconnected"),
                    _ => {}
                },
                Err(err) => {
                    warn!("node mqtt poll error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt thread")?;

    if let Err(err) = mqtt.publish(
        &status_topic,
        QoS::AtLeastOnce,
        true,
        NodeStatus::Online.as_str().as_bytes(),
    ) {
        warn!("failed to publish node online status: {err:?}");
    }

    // Keep services alive for the program lifetime.
    let _sntp = sntp;
    let mut wifi_disconnected_since: Option<Instant> = None;

    loop {
        feed_watchdog();
        maintain_wifi_health(&mut wifi, &mut wifi_disconnected_since);

        if let Some((temperature, humidity)) = sensor.read() {
            let now = Utc::now().with_timezone(&offset);
            let measurement = Measurement::new(temperature, humidity, &now);
            match measurement.to_json() {
                Ok(payload) => {
                    if let Err(err) = mqtt.publish(
                        &config.broker.topic,
                        QoS::AtLeastOnce,
                        false,
                        payload.as_bytes(),
                    ) {
                        warn!("failed to publish measurement: {err:?}");
                    }
                }
                Err(err) => warn!("failed to encode measurement: {err}"),
            }
        }

        for _ in 0..config.sensor.publish_interval_secs {
            feed_watchdog();
            maintain_wifi_health(&mut wifi, &mut wifi_disconnected_since);
            if let Some(led) = status_led.as_mut() {
                led.set(wifi_disconnected_since.is_none());
            }
            thread::sleep(Duration::from_secs(1));
        }
    }
}

fn load_device_config(nvs_store: &NvsStore) -> anyhow::Result<DeviceConfig> {
    let stored = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load device config from NVS: {err:#}");
        None
    });

    let stored_json = stored.as_ref().map(DeviceConfig::to_json).transpose()?;
    let mut config = seed_device_config(stored, build_time_value)
        .context("invalid build-time provisioning values")?;
    config.sanitize();
    config.validate()?;

    if config.networks.is_empty() {
        warn!("no wifi networks provisioned; flash with WIFI_NETWORKS set");
    }

    if stored_json.as_deref() != Some(config.to_json()?.as_str()) {
        match nvs_store.save_config(&config) {
            Ok(()) => info!("device config persisted to NVS"),
            Err(err) => warn!("failed to persist device config: {err:#}"),
        }
    }

    Ok(config)
}

fn build_time_value(key: &str) -> Option<String> {
    let value = match key {
        ENV_WIFI_NETWORKS => option_env!("WIFI_NETWORKS"),
        ENV_MQTT_HOST => option_env!("MQTT_HOST"),
        ENV_MQTT_PORT => option_env!("MQTT_PORT"),
        ENV_MQTT_USER => option_env!("MQTT_USER"),
        ENV_MQTT_PASS => option_env!("MQTT_PASS"),
        ENV_FIREBASE_HOST => option_env!("FIREBASE_HOST"),
        ENV_FIREBASE_AUTH => option_env!("FIREBASE_AUTH"),
        ENV_MQTT_CLIENT_ID => option_env!("MQTT_CLIENT_ID"),
        ENV_MQTT_TOPIC => option_env!("MQTT_TOPIC"),
        ENV_NTP_SERVER => option_env!("NTP_SERVER"),
        ENV_GMT_OFFSET_SEC => option_env!("GMT_OFFSET_SEC"),
        ENV_DAYLIGHT_OFFSET_SEC => option_env!("DAYLIGHT_OFFSET_SEC"),
        _ => None,
    };
    value.map(str::to_string)
}

fn create_mqtt_client(
    config: &DeviceConfig,
    status_topic: &str,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let broker = &config.broker;
    let url = broker.url();

    let conf = MqttClientConfiguration {
        client_id: Some(broker.client_id.as_str()),
        username: if broker.username.is_empty() {
            None
        } else {
            Some(broker.username.as_str())
        },
        password: if secret::is_set(&broker.password) {
            Some(broker.password.expose_secret())
        } else {
            None
        },
        lwt: Some(LwtConfiguration {
            topic: status_topic,
            payload: NodeStatus::Offline.as_str().as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        crt_bundle_attach: if broker.requires_tls() {
            Some(esp_idf_svc::sys::esp_crt_bundle_attach)
        } else {
            None
        },
        ..Default::default()
    };

    info!("connecting to mqtt broker {url}");
    Ok(EspMqttClient::new(&url, &conf)?)
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<Option<DeviceConfig>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(Some(DeviceConfig::from_json(value)?)),
            None => Ok(None),
        }
    }

    fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_str(NVS_CONFIG_KEY, &config.to_json()?)?;
        Ok(())
    }
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

/// Blinks the status LED, then reboots so the whole list is tried again.
fn restart_after_no_network(status_led: &mut Option<StatusLed>) -> ! {
    let started = Instant::now();
    while started.elapsed() < Duration::from_millis(NO_NETWORK_RESTART_DELAY_MS) {
        let phase = started.elapsed().as_millis() as u64 / LED_FAST_BLINK_MS;
        if let Some(led) = status_led.as_mut() {
            led.set(phase % 2 == 0);
        }
        thread::sleep(Duration::from_millis(LED_FAST_BLINK_MS / 2));
    }

    unsafe { esp_idf_svc::sys::esp_restart() }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

/// Reconnects to the adopted network once per outage and reboots if the
/// outage outlasts the grace period.
fn maintain_wifi_health(wifi: &mut EspWifi<'static>, disconnected_since: &mut Option<Instant>) {
    if wifi.is_connected().unwrap_or(false) {
        if disconnected_since.take().is_some() {
            info!("wifi link restored");
        }
        return;
    }

    match disconnected_since {
        Some(since) if since.elapsed().as_millis() as u64 >= WIFI_RESTART_GRACE_MS => {
            warn!(
                "wifi disconnected for {}s; restarting device for recovery",
                WIFI_RESTART_GRACE_MS / 1000
            );
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        Some(_) => {}
        None => {
            warn!("wifi link lost; reconnecting");
            *disconnected_since = Some(Instant::now());
            if let Err(err) = wifi.connect() {
                warn!("wifi reconnect request failed: {err}");
            }
        }
    }
}
