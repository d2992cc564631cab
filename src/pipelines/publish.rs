//! Save the current temperature to a timestamped file, upload it, notify

use super::{fetch_current, io_failure, Services};
use crate::atomic::write_atomic;
use crate::error::{FlowError, TaskFailure};
use crate::execution::flow::{Flow, Input, Step};
use crate::execution::task::{input, output, Task};
use crate::forecast::TEMPERATURE;

pub const FLOW_NAME: &str = "publish";

pub const FETCH_TEMPERATURE: &str = "Fetch temperature";
pub const CREATE_FILENAME: &str = "Create filename";
pub const SAVE: &str = "Save weather";
pub const UPLOAD: &str = "Upload file";
pub const NOTIFY: &str = "Notify";

pub const FILENAME_FORMAT: &str = "weather_%Y-%m-%d_%H-%M-%S.csv";

pub fn flow(services: &Services) -> Result<Flow, FlowError> {
    Flow::builder(FLOW_NAME)
        .arg("lat")
        .arg("lon")
        .step(
            Step::new(fetch_current(FETCH_TEMPERATURE, TEMPERATURE, services))
                .inputs([Input::arg("lat"), Input::arg("lon")]),
        )
        .step(Step::new(filename_task(services)))
        .step(Step::new(save_task(services)).inputs([Input::step(FETCH_TEMPERATURE), Input::step(CREATE_FILENAME)]))
        .step(Step::new(upload_task(services)).inputs([Input::step(CREATE_FILENAME), Input::step(SAVE)]))
        .step(Step::new(notify_task(services)).inputs([Input::step(CREATE_FILENAME), Input::step(UPLOAD)]))
        .output(UPLOAD)
        .build()
}

fn filename_task(services: &Services) -> Task {
    let clock = services.clock.clone();

    Task::new(CREATE_FILENAME, move |_| {
        let filename = clock.now().format(FILENAME_FORMAT).to_string();
        async move { output(filename) }
    })
}

fn save_task(services: &Services) -> Task {
    let dir = services.output_dir.clone();

    Task::new(SAVE, move |inputs| {
        let dir = dir.clone();
        async move {
            let temperature: f64 = input(&inputs, 0)?;
            let filename: String = input(&inputs, 1)?;

            let path = dir.join(&filename);
            write_atomic(&path, format!("{:?}", temperature)).map_err(|e| io_failure(&path, e))?;
            output("Successfully wrote temp")
        }
    })
}

fn upload_task(services: &Services) -> Task {
    let dir = services.output_dir.clone();
    let store = services.store.clone();

    Task::new(UPLOAD, move |inputs| {
        let dir = dir.clone();
        let store = store.clone();
        async move {
            let filename: String = input(&inputs, 0)?;
            store
                .upload(&dir.join(&filename), &filename)
                .await
                .map_err(|e| TaskFailure::transient(format!("{:#}", e)))?;
            output(filename)
        }
    })
}

fn notify_task(services: &Services) -> Task {
    let notifier = services.notifier.clone();

    Task::new(NOTIFY, move |inputs| {
        let notifier = notifier.clone();
        async move {
            let filename: String = input(&inputs, 0)?;
            let message = format!("Uploaded {} to the weather bucket", filename);
            notifier
                .notify(&message)
                .await
                .map_err(|e| TaskFailure::transient(format!("notification failed: {:#}", e)))?;
            output(message)
        }
    })
}
