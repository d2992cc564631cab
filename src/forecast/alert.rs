//! Bad-weather detection

use chrono::{DateTime, SecondsFormat, Utc};
use std::io;
use std::path::Path;

use super::csv::escape_field;
use crate::atomic::write_atomic;
use crate::config::AlertConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Rain in mm
    pub rain: f64,
    /// Cloud cover in percent
    pub cloud: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from(AlertConfig::default())
    }
}

impl From<AlertConfig> for Thresholds {
    fn from(config: AlertConfig) -> Self {
        Self {
            rain: config.rain,
            cloud: config.cloud,
        }
    }
}

impl Thresholds {
    pub fn is_bad_weather(&self, rain: f64, cloud: f64) -> bool {
        rain > self.rain || cloud > self.cloud
    }
}

pub fn alert_message(location: &str, rain: f64, cloud: f64) -> String {
    format!(
        "Bad weather in {}: rain {:?} mm, cloud cover {:?}%",
        location, rain, cloud
    )
}

/// Replace `path` with a single `location,timestamp` row
pub fn write_alert(path: &Path, location: &str, at: DateTime<Utc>) -> io::Result<()> {
    let row = format!(
        "{},{}\n",
        escape_field(location),
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    write_atomic(path, row)
}
