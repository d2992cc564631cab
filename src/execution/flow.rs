//! Statically declared flows and the runner that executes them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::context::RunContext;
use super::retry::RetryPolicy;
use super::task::Task;
use crate::artifacts::Artifact;
use crate::error::{FlowError, TaskFailure};

/// Named arguments a flow is invoked with
pub type FlowArgs = BTreeMap<String, Value>;

/// Where a step input comes from
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// A flow argument
    Arg(String),
    /// The output of an earlier step
    Step(String),
    /// A constant
    Value(Value),
}

impl Input {
    pub fn arg(name: &str) -> Self {
        Self::Arg(name.to_string())
    }

    pub fn step(name: &str) -> Self {
        Self::Step(name.to_string())
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }
}

type Predicate = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

#[derive(Clone)]
struct Condition {
    steps: Vec<String>,
    predicate: Predicate,
}

/// Artifact recorded from a step's output once it succeeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub key: String,
    pub description: String,
}

/// One invocation of a task inside a flow
#[derive(Clone)]
pub struct Step {
    task: Task,
    inputs: Vec<Input>,
    condition: Option<Condition>,
    artifact: Option<ArtifactSpec>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("task", &self.task.name())
            .field("inputs", &self.inputs)
            .field("condition", &self.condition.as_ref().map(|c| &c.steps))
            .field("artifact", &self.artifact)
            .finish()
    }
}

impl Step {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            inputs: Vec::new(),
            condition: None,
            artifact: None,
        }
    }

    pub fn input(mut self, input: Input) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn inputs(mut self, inputs: impl IntoIterator<Item = Input>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    /// Only run when `predicate` holds for the outputs of `steps`, in order
    pub fn when<F>(mut self, steps: &[&str], predicate: F) -> Self
    where
        F: Fn(&[Value]) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Condition {
            steps: steps.iter().map(|s| s.to_string()).collect(),
            predicate: Arc::new(predicate),
        });
        self
    }

    /// Record the step's output as an artifact
    pub fn publish(mut self, key: &str, description: &str) -> Self {
        self.artifact = Some(ArtifactSpec {
            key: key.to_string(),
            description: description.to_string(),
        });
        self
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Earlier steps this step reads from, through inputs or its condition
    fn dependencies(&self) -> impl Iterator<Item = &str> {
        let inputs = self.inputs.iter().filter_map(|input| match input {
            Input::Step(name) => Some(name.as_str()),
            _ => None,
        });
        let condition = self
            .condition
            .iter()
            .flat_map(|c| c.steps.iter().map(|s| s.as_str()));
        inputs.chain(condition)
    }

    fn resolve(&self, args: &FlowArgs, outputs: &HashMap<&str, Value>) -> Vec<Value> {
        self.inputs
            .iter()
            .map(|input| match input {
                Input::Arg(name) => args.get(name).cloned().unwrap_or(Value::Null),
                Input::Step(name) => outputs.get(name.as_str()).cloned().unwrap_or(Value::Null),
                Input::Value(value) => value.clone(),
            })
            .collect()
    }
}

/// What happens to the rest of a run after a step fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Abort steps that depend on the failure, keep running the others
    #[default]
    ContinueIndependent,
    /// Run nothing after the first failure
    StopOnFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// Some step failed or was aborted, but the flow's output was still produced
    PartiallyFailed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::PartiallyFailed => "partially_failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "partially_failed" => Some(RunStatus::PartiallyFailed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded {
        value: Value,
        cached: bool,
        attempts: u32,
    },
    Failed {
        cause: TaskFailure,
        attempts: u32,
    },
    /// Not executed because `upstream` failed
    Aborted { upstream: String },
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Succeeded { .. } => "succeeded",
            StepOutcome::Failed { .. } => "failed",
            StepOutcome::Aborted { .. } => "aborted",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            StepOutcome::Succeeded { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            StepOutcome::Succeeded { attempts, .. } | StepOutcome::Failed { attempts, .. } => *attempts,
            StepOutcome::Aborted { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub inputs: Vec<Value>,
    pub outcome: StepOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// One execution of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    pub run_id: String,
    pub flow: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Executed steps in declared order; skipped steps have no record
    pub records: Vec<StepRecord>,
    pub output: Option<Value>,
    pub artifacts: Vec<Artifact>,
    /// Flow-level attempts made
    pub attempts: u32,
}

impl FlowRun {
    pub fn record(&self, step: &str) -> Option<&StepRecord> {
        self.records.iter().find(|r| r.step == step)
    }

    pub fn output_of(&self, step: &str) -> Option<&Value> {
        self.record(step).and_then(|r| r.outcome.value())
    }

    /// The first step that failed outright
    pub fn first_failure(&self) -> Option<&StepRecord> {
        self.records
            .iter()
            .find(|r| matches!(r.outcome, StepOutcome::Failed { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// An ordered, validated composition of steps
pub struct Flow {
    name: String,
    args: Vec<String>,
    steps: Vec<Step>,
    output: Option<String>,
    failure_mode: FailureMode,
    retry: RetryPolicy,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("steps", &self.step_names())
            .field("output", &self.output)
            .field("failure_mode", &self.failure_mode)
            .field("retry", &self.retry)
            .finish()
    }
}

struct Pass {
    status: RunStatus,
    records: Vec<StepRecord>,
    output: Option<Value>,
    artifacts: Vec<Artifact>,
}

impl Flow {
    pub fn builder(name: &str) -> FlowBuilder {
        FlowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run the flow, retrying the whole run as configured.
    ///
    /// Task failures are reported in the returned [`FlowRun`]; `Err` only
    /// signals an invalid invocation.
    pub async fn run(&self, args: &FlowArgs, ctx: &RunContext) -> Result<FlowRun, FlowError> {
        if let Some(missing) = self.args.iter().find(|a| !args.contains_key(*a)) {
            return Err(FlowError::MissingArgument(missing.clone()));
        }

        let started_at = ctx.clock().now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        tracing::info!(flow = %self.name, run_id = ctx.run_id(), "flow started");

        loop {
            attempt += 1;
            let pass = self.run_once(args, ctx).await;

            let retryable = matches!(pass.status, RunStatus::Failed | RunStatus::PartiallyFailed);
            if !retryable || attempt >= max_attempts || ctx.is_cancelled() {
                tracing::info!(
                    flow = %self.name,
                    run_id = ctx.run_id(),
                    status = %pass.status,
                    attempts = attempt,
                    "flow finished"
                );

                return Ok(FlowRun {
                    run_id: ctx.run_id().to_string(),
                    flow: self.name.clone(),
                    started_at,
                    finished_at: ctx.clock().now(),
                    status: pass.status,
                    records: pass.records,
                    output: pass.output,
                    artifacts: pass.artifacts,
                    attempts: attempt,
                });
            }

            let delay = self.retry.delay_for_retry(attempt);
            tracing::warn!(
                flow = %self.name,
                attempt,
                status = %pass.status,
                "flow attempt failed, retrying in {}ms",
                delay.as_millis()
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn run_once(&self, args: &FlowArgs, ctx: &RunContext) -> Pass {
        let mut outputs: HashMap<&str, Value> = HashMap::new();
        // Step name -> the failed step that made it unavailable
        let mut unavailable: HashMap<&str, String> = HashMap::new();
        let mut skipped: HashSet<&str> = HashSet::new();
        let mut records = Vec::new();
        let mut artifacts = Vec::new();
        let mut cancelled = false;

        for step in &self.steps {
            let name = step.name();

            if ctx.is_cancelled() {
                tracing::info!(flow = %self.name, step = name, "run cancelled before step");
                cancelled = true;
                break;
            }

            if self.failure_mode == FailureMode::StopOnFirst && !unavailable.is_empty() {
                break;
            }

            if let Some(upstream) = step.dependencies().find_map(|dep| unavailable.get(dep).cloned()) {
                tracing::warn!(flow = %self.name, step = name, upstream = %upstream, "step aborted");
                records.push(StepRecord {
                    step: name.to_string(),
                    inputs: Vec::new(),
                    outcome: StepOutcome::Aborted {
                        upstream: upstream.clone(),
                    },
                    started_at: ctx.clock().now(),
                    duration_ms: 0,
                });
                unavailable.insert(name, upstream);
                continue;
            }

            if step.dependencies().any(|dep| skipped.contains(dep)) {
                skipped.insert(name);
                continue;
            }

            if let Some(condition) = &step.condition {
                let values: Vec<Value> = condition
                    .steps
                    .iter()
                    .map(|s| outputs.get(s.as_str()).cloned().unwrap_or(Value::Null))
                    .collect();
                if !(condition.predicate)(&values) {
                    tracing::info!(flow = %self.name, step = name, "condition not met, skipping");
                    skipped.insert(name);
                    continue;
                }
            }

            let inputs = step.resolve(args, &outputs);
            let started_at = ctx.clock().now();
            let timer = Instant::now();

            let outcome = match step.task.invoke(inputs.clone(), ctx).await {
                Ok(output) => match publish(step, &output.value, ctx) {
                    Ok(artifact) => {
                        if let Some(artifact) = artifact {
                            // Same key twice in one run: the later record replaces the earlier
                            artifacts.retain(|a: &Artifact| a.key != artifact.key);
                            artifacts.push(artifact);
                        }
                        tracing::info!(
                            flow = %self.name,
                            step = name,
                            cached = output.cached,
                            attempts = output.attempts,
                            "step completed"
                        );
                        StepOutcome::Succeeded {
                            value: output.value,
                            cached: output.cached,
                            attempts: output.attempts,
                        }
                    }
                    Err(cause) => StepOutcome::Failed {
                        cause,
                        attempts: output.attempts,
                    },
                },
                Err(failure) => StepOutcome::Failed {
                    cause: failure.cause,
                    attempts: failure.attempts,
                },
            };

            match &outcome {
                StepOutcome::Succeeded { value, .. } => {
                    outputs.insert(name, value.clone());
                }
                StepOutcome::Failed { cause, attempts } => {
                    tracing::warn!(
                        flow = %self.name,
                        step = name,
                        attempts,
                        error = %cause,
                        "step failed"
                    );
                    unavailable.insert(name, name.to_string());
                }
                StepOutcome::Aborted { .. } => {}
            }

            records.push(StepRecord {
                step: name.to_string(),
                inputs,
                outcome,
                started_at,
                duration_ms: timer.elapsed().as_millis() as i64,
            });
        }

        let failed = records.iter().any(|r| !r.outcome.is_success());
        let output = match &self.output {
            Some(step) => outputs.get(step.as_str()).cloned(),
            None => records.last().and_then(|r| r.outcome.value().cloned()),
        };

        let status = if cancelled {
            RunStatus::Cancelled
        } else if !failed {
            RunStatus::Succeeded
        } else if output.is_some() {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Failed
        };

        Pass {
            status,
            records,
            output,
            artifacts,
        }
    }
}

/// Record the step's artifact, if it declares one
fn publish(step: &Step, value: &Value, ctx: &RunContext) -> Result<Option<Artifact>, TaskFailure> {
    let Some(spec) = &step.artifact else {
        return Ok(None);
    };

    let content = match value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };

    ctx.record_artifact(&spec.key, content, &spec.description)
        .map(Some)
        .map_err(TaskFailure::permanent)
}

pub struct FlowBuilder {
    name: String,
    args: Vec<String>,
    steps: Vec<Step>,
    output: Option<String>,
    failure_mode: FailureMode,
    retry: RetryPolicy,
}

impl FlowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            args: Vec::new(),
            steps: Vec::new(),
            output: None,
            failure_mode: FailureMode::default(),
            retry: RetryPolicy::none(),
        }
    }

    pub fn arg(mut self, name: &str) -> Self {
        self.args.push(name.to_string());
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Use this step's value as the run's output
    pub fn output(mut self, step: &str) -> Self {
        self.output = Some(step.to_string());
        self
    }

    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Re-run the whole flow when it ends failed or partially failed
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn build(self) -> Result<Flow, FlowError> {
        if self.steps.is_empty() {
            return Err(FlowError::Empty(self.name));
        }

        let mut declared: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            for input in &step.inputs {
                match input {
                    Input::Arg(arg) if !self.args.contains(arg) => {
                        return Err(FlowError::UnknownArgument {
                            step: step.name().to_string(),
                            arg: arg.clone(),
                        });
                    }
                    _ => {}
                }
            }

            if let Some(reference) = step.dependencies().find(|dep| !declared.contains(dep)) {
                return Err(FlowError::UnknownStep {
                    step: step.name().to_string(),
                    reference: reference.to_string(),
                });
            }

            if !declared.insert(step.name()) {
                return Err(FlowError::DuplicateStep(step.name().to_string()));
            }
        }

        if let Some(output) = &self.output {
            if !declared.contains(output.as_str()) {
                return Err(FlowError::UnknownOutput(output.clone()));
            }
        }

        Ok(Flow {
            name: self.name,
            args: self.args,
            steps: self.steps,
            output: self.output,
            failure_mode: self.failure_mode,
            retry: self.retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryArtifactSink;
    use crate::execution::cache::TaskCache;
    use crate::execution::clock::SystemClock;
    use crate::execution::task::{input, output};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn context() -> RunContext {
        RunContext::new(Arc::new(TaskCache::in_memory(Arc::new(SystemClock))))
    }

    fn args(pairs: &[(&str, Value)]) -> FlowArgs {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn echo(name: &str) -> Task {
        Task::new(name, |inputs| async move { Ok(inputs.into_iter().next().unwrap_or(Value::Null)) })
    }

    fn failing(name: &str, calls: Arc<AtomicU32>) -> Task {
        Task::new(name, move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskFailure::transient("HTTP 503")) }
        })
    }

    fn counting(name: &str, calls: Arc<AtomicU32>) -> Task {
        Task::new(name, move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!("done")) }
        })
    }

    #[tokio::test]
    async fn test_linear_flow_wires_outputs() {
        let double = Task::new("double", |inputs| async move {
            let x: f64 = input(&inputs, 0)?;
            output(x * 2.0)
        });
        let label = Task::new("label", |inputs| async move {
            let x: f64 = input(&inputs, 0)?;
            let unit: String = input(&inputs, 1)?;
            output(format!("{:?}{}", x, unit))
        });

        let flow = Flow::builder("linear")
            .arg("x")
            .step(Step::new(double).input(Input::arg("x")))
            .step(Step::new(label).inputs([Input::step("double"), Input::value("mm")]))
            .build()
            .unwrap();

        let run = flow.run(&args(&[("x", json!(1.5))]), &context()).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.output, Some(json!("3.0mm")));
        assert_eq!(run.attempts, 1);
        let steps: Vec<_> = run.records.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(steps, vec!["double", "label"]);
        assert_eq!(run.record("label").unwrap().inputs, vec![json!(3.0), json!("mm")]);
    }

    fn alert_flow(notified: Arc<AtomicU32>) -> Flow {
        Flow::builder("alert")
            .arg("rain")
            .arg("cloud")
            .step(Step::new(echo("Fetch rain")).input(Input::arg("rain")))
            .step(Step::new(echo("Fetch cloud")).input(Input::arg("cloud")))
            .step(
                Step::new(counting("Report bad weather", notified))
                    .when(&["Fetch rain", "Fetch cloud"], |values| {
                        let rain = values[0].as_f64().unwrap_or(0.0);
                        let cloud = values[1].as_f64().unwrap_or(0.0);
                        rain > 1.0 || cloud > 90.0
                    }),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_conditional_branch_runs_when_threshold_exceeded() {
        let notified = Arc::new(AtomicU32::new(0));
        let flow = alert_flow(notified.clone());

        let run = flow
            .run(&args(&[("rain", json!(1.5)), ("cloud", json!(50))]), &context())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(run.record("Report bad weather").is_some());
    }

    #[tokio::test]
    async fn test_conditional_branch_skipped_below_threshold() {
        let notified = Arc::new(AtomicU32::new(0));
        let flow = alert_flow(notified.clone());

        let run = flow
            .run(&args(&[("rain", json!(0.5)), ("cloud", json!(10))]), &context())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        assert!(run.record("Report bad weather").is_none());
        assert_eq!(run.records.len(), 2);
    }

    #[tokio::test]
    async fn test_steps_after_skipped_step_are_skipped() {
        let calls = Arc::new(AtomicU32::new(0));
        let flow = Flow::builder("skip")
            .step(Step::new(echo("source")).input(Input::value(0)))
            .step(Step::new(echo("gate")).input(Input::step("source")).when(&["source"], |_| false))
            .step(Step::new(counting("after", calls.clone())).input(Input::step("gate")))
            .build()
            .unwrap();

        let run = flow.run(&FlowArgs::new(), &context()).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(run.records.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_aborts_dependents_and_continues_independent() {
        let failed_calls = Arc::new(AtomicU32::new(0));
        let dependent_calls = Arc::new(AtomicU32::new(0));
        let independent_calls = Arc::new(AtomicU32::new(0));

        let flow = Flow::builder("partial")
            .step(Step::new(failing("fetch", failed_calls.clone())))
            .step(Step::new(counting("save", dependent_calls.clone())).input(Input::step("fetch")))
            .step(Step::new(counting("notify", independent_calls.clone())))
            .step(Step::new(echo("report")).input(Input::step("save")))
            .output("notify")
            .build()
            .unwrap();

        let run = flow.run(&FlowArgs::new(), &context()).await.unwrap();

        assert_eq!(run.status, RunStatus::PartiallyFailed);
        assert_eq!(dependent_calls.load(Ordering::SeqCst), 0);
        assert_eq!(independent_calls.load(Ordering::SeqCst), 1);

        let failure = run.first_failure().unwrap();
        assert_eq!(failure.step, "fetch");
        assert_eq!(
            failure.outcome,
            StepOutcome::Failed {
                cause: TaskFailure::transient("HTTP 503"),
                attempts: 1
            }
        );
        assert_eq!(
            run.record("save").unwrap().outcome,
            StepOutcome::Aborted { upstream: "fetch".into() }
        );
        assert_eq!(
            run.record("report").unwrap().outcome,
            StepOutcome::Aborted { upstream: "fetch".into() }
        );
    }

    #[tokio::test]
    async fn test_failure_without_output_fails_run() {
        let flow = Flow::builder("failing")
            .step(Step::new(failing("fetch", Arc::new(AtomicU32::new(0)))))
            .step(Step::new(echo("save")).input(Input::step("fetch")))
            .build()
            .unwrap();

        let run = flow.run(&FlowArgs::new(), &context()).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.output, None);
    }

    #[tokio::test]
    async fn test_stop_on_first_failure() {
        let later = Arc::new(AtomicU32::new(0));
        let flow = Flow::builder("strict")
            .step(Step::new(failing("fetch", Arc::new(AtomicU32::new(0)))))
            .step(Step::new(counting("independent", later.clone())))
            .failure_mode(FailureMode::StopOnFirst)
            .build()
            .unwrap();

        let run = flow.run(&FlowArgs::new(), &context()).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(run.records.len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_between_steps() {
        let ctx = context();
        let token = ctx.cancellation().clone();
        let later = Arc::new(AtomicU32::new(0));

        let cancel = Task::new("cancel", move |_| {
            token.cancel();
            async { Ok(json!("first")) }
        });

        let flow = Flow::builder("cancellable")
            .step(Step::new(cancel))
            .step(Step::new(counting("second", later.clone())))
            .build()
            .unwrap();

        let run = flow.run(&FlowArgs::new(), &ctx).await.unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(run.records.len(), 1);
        assert!(run.records[0].outcome.is_success());
    }

    #[tokio::test]
    async fn test_task_retry_exhausts_before_flow_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let flow = Flow::builder("retried")
            .step(Step::new(
                failing("fetch", calls.clone()).with_retry(RetryPolicy::constant(3, Duration::ZERO)),
            ))
            .retry(RetryPolicy::constant(2, Duration::ZERO))
            .build()
            .unwrap();

        let run = flow.run(&FlowArgs::new(), &context()).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(run.first_failure().unwrap().outcome.attempts(), 3);
    }

    #[tokio::test]
    async fn test_flow_retry_reuses_cached_steps() {
        let upstream_calls = Arc::new(AtomicU32::new(0));
        let downstream_calls = Arc::new(AtomicU32::new(0));
        let counter = downstream_calls.clone();

        let flaky = Task::new("report", move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TaskFailure::transient("webhook timeout"))
                } else {
                    Ok(json!("sent"))
                }
            }
        });

        let flow = Flow::builder("retried")
            .step(Step::new(
                counting("fetch", upstream_calls.clone()).with_cache(Duration::from_secs(60)),
            ))
            .step(Step::new(flaky).input(Input::step("fetch")))
            .retry(RetryPolicy::constant(3, Duration::ZERO))
            .build()
            .unwrap();

        let run = flow.run(&FlowArgs::new(), &context()).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.attempts, 2);
        assert_eq!(upstream_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            run.record("fetch").unwrap().outcome,
            StepOutcome::Succeeded {
                value: json!("done"),
                cached: true,
                attempts: 0
            }
        );
    }

    #[tokio::test]
    async fn test_published_step_records_artifact() {
        let sink = Arc::new(MemoryArtifactSink::new());
        let ctx = context().with_artifacts(sink.clone());

        let flow = Flow::builder("report")
            .step(
                Step::new(echo("Log next forecast"))
                    .input(Input::value("# Weather in 51.5, -0.12"))
                    .publish("weather-forecast", "The forecast for the next hour"),
            )
            .build()
            .unwrap();

        let run = flow.run(&FlowArgs::new(), &ctx).await.unwrap();

        assert_eq!(run.artifacts.len(), 1);
        assert_eq!(run.artifacts[0].content, "# Weather in 51.5, -0.12");
        assert_eq!(run.artifacts[0].run_id, ctx.run_id());
        assert_eq!(sink.artifacts(), run.artifacts);
    }

    #[tokio::test]
    async fn test_same_artifact_key_keeps_last_record() {
        let sink = Arc::new(MemoryArtifactSink::new());
        let ctx = context().with_artifacts(sink.clone());

        let flow = Flow::builder("report")
            .step(
                Step::new(echo("first"))
                    .input(Input::value("draft"))
                    .publish("weather-forecast", "Draft forecast"),
            )
            .step(
                Step::new(echo("second"))
                    .input(Input::value("final"))
                    .publish("weather-forecast", "Final forecast"),
            )
            .build()
            .unwrap();

        let run = flow.run(&FlowArgs::new(), &ctx).await.unwrap();

        assert_eq!(run.artifacts.len(), 1);
        assert_eq!(run.artifacts[0].content, "final");
        assert_eq!(sink.artifacts(), run.artifacts);
    }

    #[tokio::test]
    async fn test_missing_argument() {
        let flow = Flow::builder("args")
            .arg("lat")
            .step(Step::new(echo("fetch")).input(Input::arg("lat")))
            .build()
            .unwrap();

        let result = flow.run(&FlowArgs::new(), &context()).await;
        assert_eq!(result.unwrap_err(), FlowError::MissingArgument("lat".into()));
    }

    #[test]
    fn test_builder_validation() {
        assert_eq!(
            Flow::builder("empty").build().unwrap_err(),
            FlowError::Empty("empty".into())
        );

        let duplicate = Flow::builder("dup")
            .step(Step::new(echo("a")))
            .step(Step::new(echo("a")))
            .build();
        assert_eq!(duplicate.unwrap_err(), FlowError::DuplicateStep("a".into()));

        let forward = Flow::builder("forward")
            .step(Step::new(echo("a")).input(Input::step("b")))
            .step(Step::new(echo("b")))
            .build();
        assert_eq!(
            forward.unwrap_err(),
            FlowError::UnknownStep {
                step: "a".into(),
                reference: "b".into()
            }
        );

        let condition = Flow::builder("condition")
            .step(Step::new(echo("a")).when(&["ghost"], |_| true))
            .build();
        assert!(matches!(condition.unwrap_err(), FlowError::UnknownStep { .. }));

        let arg = Flow::builder("arg")
            .step(Step::new(echo("a")).input(Input::arg("lat")))
            .build();
        assert_eq!(
            arg.unwrap_err(),
            FlowError::UnknownArgument {
                step: "a".into(),
                arg: "lat".into()
            }
        );

        let output = Flow::builder("output")
            .step(Step::new(echo("a")))
            .output("b")
            .build();
        assert_eq!(output.unwrap_err(), FlowError::UnknownOutput("b".into()));
    }

    #[test]
    fn test_run_status_round_trip() {
        for status in [
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::PartiallyFailed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("running"), None);
    }
}
