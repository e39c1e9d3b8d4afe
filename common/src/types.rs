use chrono::{DateTime, SecondsFormat, TimeZone};
use serde::{Deserialize, Serialize};

/// Telemetry record published to the broker topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub temperature: f32,
    pub humidity: f32,
    pub timestamp: String,
}

impl Measurement {
    pub fn new<Tz: TimeZone>(temperature: f32, humidity: f32, at: &DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        Self {
            temperature: round_tenths(temperature),
            humidity: round_tenths(humidity),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn round_tenths(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Online,
    Offline,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn measurement_json_matches_dashboard_shape() {
        let at = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2025, 11, 3, 14, 5, 9)
            .unwrap();
        let measurement = Measurement::new(21.46, 40.0, &at);

        assert_eq!(
            measurement.to_json().unwrap(),
            r#"{"temperature":21.5,"humidity":40.0,"timestamp":"2025-11-03T14:05:09+02:00"}"#
        );
    }

    #[test]
    fn utc_timestamps_use_z_suffix() {
        let at = chrono::Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(
            Measurement::new(0.0, 0.0, &at).timestamp,
            "2025-01-01T00:00:00Z"
        );
    }
}
