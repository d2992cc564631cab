//! Bad-weather alert for one location

use serde_json::Value;

use super::{fetch_current, io_failure, Services};
use crate::error::{FlowError, TaskFailure};
use crate::execution::flow::{Flow, FlowArgs, Input, Step};
use crate::execution::task::{input, output, Task};
use crate::forecast::alert::{alert_message, write_alert};
use crate::forecast::{CLOUD_COVER, RAIN};

pub const FLOW_NAME: &str = "alert";

pub const FETCH_RAIN: &str = "Fetch rain";
pub const FETCH_CLOUD: &str = "Fetch cloud cover";
pub const REPORT: &str = "Report bad weather";

pub const ALERT_FILE: &str = "alert.csv";

pub fn flow(services: &Services) -> Result<Flow, FlowError> {
    let thresholds = services.thresholds;
    let location = [Input::arg("lat"), Input::arg("lon")];

    Flow::builder(FLOW_NAME)
        .arg("loc")
        .arg("lat")
        .arg("lon")
        .step(Step::new(fetch_current(FETCH_RAIN, RAIN, services)).inputs(location.clone()))
        .step(Step::new(fetch_current(FETCH_CLOUD, CLOUD_COVER, services)).inputs(location))
        .step(
            Step::new(report_task(services))
                .inputs([Input::arg("loc"), Input::step(FETCH_RAIN), Input::step(FETCH_CLOUD)])
                .when(&[FETCH_RAIN, FETCH_CLOUD], move |values| {
                    let rain = values.first().and_then(Value::as_f64).unwrap_or(0.0);
                    let cloud = values.get(1).and_then(Value::as_f64).unwrap_or(0.0);
                    thresholds.is_bad_weather(rain, cloud)
                }),
        )
        .build()
}

pub fn args(location: &str, lat: f64, lon: f64) -> FlowArgs {
    let mut args = super::location_args(lat, lon);
    args.insert("loc".to_string(), Value::from(location));
    args
}

fn report_task(services: &Services) -> Task {
    let path = services.output_path(ALERT_FILE);
    let clock = services.clock.clone();
    let notifier = services.notifier.clone();

    Task::new(REPORT, move |inputs| {
        let path = path.clone();
        let notifier = notifier.clone();
        let now = clock.now();
        async move {
            let location: String = input(&inputs, 0)?;
            let rain: f64 = input(&inputs, 1)?;
            let cloud: f64 = input(&inputs, 2)?;

            write_alert(&path, &location, now).map_err(|e| io_failure(&path, e))?;

            let message = alert_message(&location, rain, cloud);
            notifier
                .notify(&message)
                .await
                .map_err(|e| TaskFailure::transient(format!("notification failed: {:#}", e)))?;

            output(message)
        }
    })
}
