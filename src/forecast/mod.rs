//! Weather data collaborators
//!
//! Provides:
//! - Hourly series validated at the provider boundary
//! - The Open-Meteo client
//! - CSV and markdown rendering
//! - Bad-weather thresholds

pub mod alert;
pub mod csv;
pub mod provider;
pub mod report;

pub use alert::Thresholds;
pub use provider::{OpenMeteoClient, WeatherProvider};

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskFailure;

/// Measures fetched by the forecast pipeline, in column order
pub const FORECAST_MEASURES: [&str; 4] = ["temperature_2m", "relativehumidity_2m", "rain", "windspeed_10m"];

pub const TEMPERATURE: &str = "temperature_2m";
pub const HUMIDITY: &str = "relativehumidity_2m";
pub const PRECIPITATION_PROBABILITY: &str = "precipitation_probability";
pub const RAIN: &str = "rain";
pub const CLOUD_COVER: &str = "cloudcover";

/// Format of the provider's hourly timestamps
pub const HOUR_FORMAT: &str = "%Y-%m-%dT%H:00";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    /// One value per hour; `None` where the provider reported null
    pub values: Vec<Option<f64>>,
}

/// Hourly forecast columns sharing one time axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlySeries {
    pub time: Vec<String>,
    pub measures: Vec<Measure>,
}

impl HourlySeries {
    /// Validate a provider response body and extract `measures` from its
    /// `hourly` object.
    pub fn from_response(body: &Value, measures: &[&str]) -> Result<Self, TaskFailure> {
        let hourly = body
            .get("hourly")
            .and_then(Value::as_object)
            .ok_or_else(|| TaskFailure::permanent("response has no 'hourly' object"))?;

        let time = hourly
            .get("time")
            .and_then(Value::as_array)
            .ok_or_else(|| TaskFailure::permanent("hourly.time is not an array"))?
            .iter()
            .map(|t| {
                t.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| TaskFailure::permanent(format!("hourly.time contains a non-string: {}", t)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let measures = measures
            .iter()
            .map(|name| {
                let column = hourly
                    .get(*name)
                    .and_then(Value::as_array)
                    .ok_or_else(|| TaskFailure::permanent(format!("hourly.{} is missing", name)))?;

                if column.len() != time.len() {
                    return Err(TaskFailure::permanent(format!(
                        "hourly.{} has {} values for {} hours",
                        name,
                        column.len(),
                        time.len()
                    )));
                }

                let values = column
                    .iter()
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        Value::Number(n) => Ok(n.as_f64()),
                        other => Err(TaskFailure::permanent(format!(
                            "hourly.{} contains a non-number: {}",
                            name, other
                        ))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(Measure {
                    name: name.to_string(),
                    values,
                })
            })
            .collect::<Result<Vec<_>, TaskFailure>>()?;

        Ok(Self { time, measures })
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn measure(&self, name: &str) -> Option<&Measure> {
        self.measures.iter().find(|m| m.name == name)
    }

    pub fn value_at(&self, measure: &str, index: usize) -> Option<f64> {
        self.measure(measure)?.values.get(index).copied().flatten()
    }

    /// The value for the first hour, which the provider reports as the current one
    pub fn first(&self, measure: &str) -> Result<f64, TaskFailure> {
        self.value_at(measure, 0)
            .ok_or_else(|| TaskFailure::permanent(format!("no current value for {}", measure)))
    }

    /// Index of the hour after `now`, truncated to the hour
    pub fn next_hour_index(&self, now: DateTime<Utc>) -> Option<usize> {
        let next = now + Duration::hours(1);
        let next = next.duration_trunc(Duration::hours(1)).unwrap_or(next);
        let target = next.format(HOUR_FORMAT).to_string();

        self.time.iter().position(|t| *t == target)
    }
}
