//! Weather pipelines built on the execution kernel
//!
//! Each pipeline is a function from [`Services`] to a validated [`Flow`].

pub mod alert;
pub mod conditions;
pub mod forecast;
pub mod publish;

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::TaskFailure;
use crate::execution::clock::Clock;
use crate::execution::flow::FlowArgs;
use crate::execution::retry::RetryPolicy;
use crate::execution::task::{input, output, Task};
use crate::forecast::{Thresholds, WeatherProvider};
use crate::notifications::Notifier;
use crate::storage::ObjectStore;

/// The collaborators pipeline tasks call out to
#[derive(Clone)]
pub struct Services {
    pub provider: Arc<dyn WeatherProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn ObjectStore>,
    /// Must be the clock of the run context the flow runs under
    pub clock: Arc<dyn Clock>,
    pub output_dir: PathBuf,
    /// Applied to every provider fetch
    pub fetch_retry: RetryPolicy,
    pub forecast_ttl: Duration,
    pub thresholds: Thresholds,
}

impl Services {
    pub fn new(
        config: &Config,
        provider: Arc<dyn WeatherProvider>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            notifier,
            store,
            clock,
            output_dir: config.output.dir.clone(),
            fetch_retry: config.retry.policy(),
            forecast_ttl: config.cache.forecast_ttl(),
            thresholds: Thresholds::from(config.alert),
        }
    }

    pub fn output_path(&self, file: &str) -> PathBuf {
        self.output_dir.join(file)
    }
}

pub fn location_args(lat: f64, lon: f64) -> FlowArgs {
    let mut args = FlowArgs::new();
    args.insert("lat".to_string(), json!(lat));
    args.insert("lon".to_string(), json!(lon));
    args
}

/// Task returning the current value of one measure at (lat, lon)
pub(crate) fn fetch_current(name: &str, measure: &'static str, services: &Services) -> Task {
    let provider = services.provider.clone();

    Task::new(name, move |inputs| {
        let provider = provider.clone();
        async move {
            let lat: f64 = input(&inputs, 0)?;
            let lon: f64 = input(&inputs, 1)?;
            let series = provider.hourly(lat, lon, &[measure]).await?;
            output(series.first(measure)?)
        }
    })
    .with_retry(services.fetch_retry.clone())
}

pub(crate) fn io_failure(path: &Path, e: std::io::Error) -> TaskFailure {
    TaskFailure::permanent(format!("failed to write {}: {}", path.display(), e))
}
