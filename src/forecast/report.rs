//! Human-readable weather reports

use chrono::{DateTime, Utc};

use super::HourlySeries;

fn value_text(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:?}", v),
        None => "n/a".to_string(),
    }
}

/// Markdown summary of the hour after `now`.
///
/// Falls back to the first hour when the series does not cover the next one.
pub fn next_hour_markdown(series: &HourlySeries, lat: f64, lon: f64, now: DateTime<Utc>) -> String {
    let index = series.next_hour_index(now).unwrap_or(0);

    let mut md = format!(
        "# Weather in {:?}, {:?}\n\nThe forecast for the next hour as of {} is...\n\n",
        lat,
        lon,
        now.format("%Y-%m-%d %H:%M:%S UTC")
    );

    for measure in &series.measures {
        let value = measure.values.get(index).copied().flatten();
        md.push_str(&format!("- {}: {}\n", measure.name, value_text(value)));
    }

    md
}

pub fn conditions_report(temperature: f64, humidity: f64, precipitation: f64) -> String {
    format!(
        "Current temp: {:?}\nCurrent humidity: {:?}\nCurrent precipitation probability: {:?}",
        temperature, humidity, precipitation
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::Measure;
    use chrono::TimeZone;

    fn series() -> HourlySeries {
        HourlySeries {
            time: vec!["2024-01-01T00:00".into(), "2024-01-01T01:00".into()],
            measures: vec![
                Measure {
                    name: "temperature_2m".into(),
                    values: vec![Some(5.0), Some(6.0)],
                },
                Measure {
                    name: "rain".into(),
                    values: vec![Some(0.0), None],
                },
            ],
        }
    }

    #[test]
    fn test_next_hour_markdown() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        let md = next_hour_markdown(&series(), 51.5, -0.12, now);

        assert_eq!(
            md,
            "# Weather in 51.5, -0.12\n\n\
             The forecast for the next hour as of 2024-01-01 00:05:00 UTC is...\n\n\
             - temperature_2m: 6.0\n\
             - rain: n/a\n"
        );
    }

    #[test]
    fn test_falls_back_to_first_hour() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let md = next_hour_markdown(&series(), 51.5, -0.12, now);
        assert!(md.contains("- temperature_2m: 5.0\n"));
        assert!(md.contains("- rain: 0.0\n"));
    }

    #[test]
    fn test_conditions_report() {
        assert_eq!(
            conditions_report(21.0, 71.5, 3.0),
            "Current temp: 21.0\nCurrent humidity: 71.5\nCurrent precipitation probability: 3.0"
        );
    }
}
