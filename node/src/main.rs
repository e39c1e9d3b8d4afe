//! Climate node firmware: joins the first reachable Wi-Fi network from the
//! configured list, then publishes DHT11 readings to the MQTT broker.
//!
//! Without the `esp32` feature the same flow runs on the desktop with
//! simulated readings.

#[cfg(feature = "esp32")]
mod esp;
#[cfg(not(feature = "esp32"))]
mod host;

#[cfg(not(feature = "esp32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run()
}
