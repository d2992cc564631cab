//! Current conditions report, with cached fetches and flow-level retry

use std::time::Duration;

use super::{fetch_current, Services};
use crate::error::FlowError;
use crate::execution::flow::{Flow, Input, Step};
use crate::execution::retry::RetryPolicy;
use crate::execution::task::{input, output, Task};
use crate::forecast::report::conditions_report;
use crate::forecast::{HUMIDITY, PRECIPITATION_PROBABILITY, TEMPERATURE};

pub const FLOW_NAME: &str = "conditions";

pub const FETCH_TEMPERATURE: &str = "Fetch temperature";
pub const FETCH_HUMIDITY: &str = "Fetch humidity";
pub const FETCH_PRECIPITATION: &str = "Fetch precipitation";
pub const REPORT: &str = "Print weather report";

const FETCH_TTL: Duration = Duration::from_secs(60);
const FLOW_RETRIES: u32 = 2;

pub fn flow(services: &Services) -> Result<Flow, FlowError> {
    let location = [Input::arg("lat"), Input::arg("lon")];

    Flow::builder(FLOW_NAME)
        .arg("lat")
        .arg("lon")
        .step(
            Step::new(fetch_current(FETCH_TEMPERATURE, TEMPERATURE, services).with_cache(FETCH_TTL))
                .inputs(location.clone()),
        )
        .step(
            Step::new(fetch_current(FETCH_HUMIDITY, HUMIDITY, services).with_cache(FETCH_TTL))
                .inputs(location.clone()),
        )
        .step(
            Step::new(
                fetch_current(FETCH_PRECIPITATION, PRECIPITATION_PROBABILITY, services).with_cache(FETCH_TTL),
            )
            .inputs(location),
        )
        .step(Step::new(report_task()).inputs([
            Input::step(FETCH_TEMPERATURE),
            Input::step(FETCH_HUMIDITY),
            Input::step(FETCH_PRECIPITATION),
        ]))
        .output(REPORT)
        .retry(RetryPolicy::retries(FLOW_RETRIES, Duration::ZERO))
        .build()
}

fn report_task() -> Task {
    Task::new(REPORT, |inputs| async move {
        let temperature: f64 = input(&inputs, 0)?;
        let humidity: f64 = input(&inputs, 1)?;
        let precipitation: f64 = input(&inputs, 2)?;

        let report = conditions_report(temperature, humidity, precipitation);
        for line in report.lines() {
            tracing::info!(target: "flowcast::report", "{}", line);
        }
        output(report)
    })
}
