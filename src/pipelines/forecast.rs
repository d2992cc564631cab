//! Hourly forecast: fetch, save as csv, publish the next hour

use std::time::Duration;

use super::{io_failure, Services};
use crate::atomic::write_atomic;
use crate::error::FlowError;
use crate::execution::flow::{Flow, Input, Step};
use crate::execution::task::{input, output, Task};
use crate::forecast::csv::write_csv;
use crate::forecast::report::next_hour_markdown;
use crate::forecast::{HourlySeries, FORECAST_MEASURES};

pub const FLOW_NAME: &str = "forecast";

pub const FETCH: &str = "Fetch weather";
pub const SAVE: &str = "Save weather";
pub const LOG: &str = "Log next forecast";

pub const CSV_FILE: &str = "weather.csv";
pub const MARKDOWN_FILE: &str = "most_recent_results.md";
pub const ARTIFACT_KEY: &str = "weather-forecast";
pub const ARTIFACT_DESCRIPTION: &str = "The forecast for the next hour";

const MARKDOWN_TTL: Duration = Duration::from_secs(3600);

pub fn flow(services: &Services) -> Result<Flow, FlowError> {
    Flow::builder(FLOW_NAME)
        .arg("lat")
        .arg("lon")
        .step(Step::new(fetch_task(services)).inputs([Input::arg("lat"), Input::arg("lon")]))
        .step(Step::new(save_task(services)).input(Input::step(FETCH)))
        .step(
            Step::new(log_task(services))
                .inputs([Input::step(FETCH), Input::arg("lat"), Input::arg("lon")])
                .publish(ARTIFACT_KEY, ARTIFACT_DESCRIPTION),
        )
        .output(SAVE)
        .build()
}

fn fetch_task(services: &Services) -> Task {
    let provider = services.provider.clone();

    Task::new(FETCH, move |inputs| {
        let provider = provider.clone();
        async move {
            let lat: f64 = input(&inputs, 0)?;
            let lon: f64 = input(&inputs, 1)?;
            output(provider.hourly(lat, lon, &FORECAST_MEASURES).await?)
        }
    })
    .with_retry(services.fetch_retry.clone())
}

fn save_task(services: &Services) -> Task {
    let path = services.output_path(CSV_FILE);

    Task::new(SAVE, move |inputs| {
        let path = path.clone();
        async move {
            let series: HourlySeries = input(&inputs, 0)?;
            tracing::debug!(path = %path.display(), hours = series.len(), "writing csv");
            write_csv(&path, &series).map_err(|e| io_failure(&path, e))?;
            output("Successfully wrote csv")
        }
    })
    .with_cache(services.forecast_ttl)
}

fn log_task(services: &Services) -> Task {
    let path = services.output_path(MARKDOWN_FILE);
    let clock = services.clock.clone();

    Task::new(LOG, move |inputs| {
        let path = path.clone();
        let now = clock.now();
        async move {
            let series: HourlySeries = input(&inputs, 0)?;
            let lat: f64 = input(&inputs, 1)?;
            let lon: f64 = input(&inputs, 2)?;

            let markdown = next_hour_markdown(&series, lat, lon, now);
            write_atomic(&path, &markdown).map_err(|e| io_failure(&path, e))?;
            output(markdown)
        }
    })
    .with_cache(MARKDOWN_TTL)
}
