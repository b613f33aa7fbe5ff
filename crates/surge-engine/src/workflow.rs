//! # Workflows
//!
//! A workflow is a named arena of [`Step`]s plus global [`WorkflowOptions`].
//! Steps are registered explicitly through typed builders; each names its
//! predecessors and carries one async callable:
//!
//! - **action** returns a [`Request`] the engine issues through the step's
//!   protocol client
//! - **task** runs local code only and returns a JSON value
//!
//! ```text
//!   Workflow::builder("checkout")
//!       .step(Step::task("login-data", TaskKind::Setup, ..))
//!       .step(Step::action("login", ProtocolKind::Http1, ..).after(&["login-data"]))
//!       .build()?            // duplicate names, unknown predecessors, cycles fail here
//! ```
//!
//! A built workflow is immutable and shared by reference with every worker.

use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use surge_core::{
    Headers, HookKind, OpError, ProtocolKind, Request, StepGraph, StepIndex, StepNode, SurgeError,
    TaskKind, WorkflowOptions,
};
use surge_protocols::ClientSet;

use crate::distribution::Distribution;
use crate::rate_limit::RateLimit;
use crate::worker::Event;

pub type ActionFn =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, anyhow::Result<Request>> + Send + Sync>;
pub type TaskFn =
    Arc<dyn Fn(StepContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// The callable a step runs
#[derive(Clone)]
pub enum Hook {
    Action {
        protocol: ProtocolKind,
        handler: ActionFn,
    },
    Task {
        kind: TaskKind,
        handler: TaskFn,
    },
}

/// Per-step execution knobs
#[derive(Clone, Debug, PartialEq)]
pub struct StepSettings {
    /// Applied to requests (and tasks) that carry no timeout of their own
    pub timeout: Option<Duration>,
    /// Overrides the request's redirect budget
    pub redirects: Option<u32>,
    /// Extra attempts for retryable failures
    pub retries: u32,
    pub rate_limit: Option<RateLimit>,
    /// Relative pick weight for the `weighted` persona
    pub weight: u32,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            timeout: None,
            redirects: None,
            retries: 0,
            rate_limit: None,
            weight: 1,
        }
    }
}

/// One declared step
#[derive(Clone)]
pub struct Step {
    name: String,
    predecessors: Vec<String>,
    hook: Hook,
    settings: StepSettings,
}

impl Step {
    pub fn action<F, Fut>(name: impl Into<String>, protocol: ProtocolKind, handler: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Request>> + Send + 'static,
    {
        let handler: ActionFn = Arc::new(move |ctx| Box::pin(handler(ctx)));
        Self::with_hook(name, Hook::Action { protocol, handler })
    }

    /// Action that issues the same request every time
    pub fn request(name: impl Into<String>, protocol: ProtocolKind, request: Request) -> Self {
        Self::action(name, protocol, move |_| {
            let request = request.clone();
            async move { Ok(request) }
        })
    }

    pub fn task<F, Fut>(name: impl Into<String>, kind: TaskKind, handler: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: TaskFn = Arc::new(move |ctx| Box::pin(handler(ctx)));
        Self::with_hook(name, Hook::Task { kind, handler })
    }

    fn with_hook(name: impl Into<String>, hook: Hook) -> Self {
        Self {
            name: name.into(),
            predecessors: Vec::new(),
            hook,
            settings: StepSettings::default(),
        }
    }

    pub fn after(mut self, predecessors: &[&str]) -> Self {
        self.predecessors
            .extend(predecessors.iter().map(|p| p.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = Some(timeout);
        self
    }

    pub fn redirects(mut self, redirects: u32) -> Self {
        self.settings.redirects = Some(redirects);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.settings.retries = retries;
        self
    }

    pub fn rate_limit(mut self, limit: RateLimit) -> Self {
        self.settings.rate_limit = Some(limit);
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.settings.weight = weight;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn predecessors(&self) -> &[String] {
        &self.predecessors
    }

    pub fn hook(&self) -> &Hook {
        &self.hook
    }

    pub fn hook_kind(&self) -> HookKind {
        match &self.hook {
            Hook::Action { .. } => HookKind::Action,
            Hook::Task { kind, .. } => HookKind::Task(*kind),
        }
    }

    /// Protocol for actions, `None` for tasks
    pub fn protocol(&self) -> Option<ProtocolKind> {
        match &self.hook {
            Hook::Action { protocol, .. } => Some(*protocol),
            Hook::Task { .. } => None,
        }
    }

    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("predecessors", &self.predecessors)
            .field("hook", &self.hook_kind())
            .field("protocol", &self.protocol())
            .field("settings", &self.settings)
            .finish()
    }
}

/// What a completed step hands to its successors
#[derive(Clone, Debug, Default)]
pub struct StepOutput {
    pub status: Option<u16>,
    pub headers: Headers,
    pub body: Bytes,
    /// Task return value; `Null` for actions
    pub value: Value,
    pub error: Option<OpError>,
}

impl StepOutput {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.map_or(true, |s| s < 400)
    }

    /// Response body parsed as JSON
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

pub type Outputs = HashMap<StepIndex, Arc<StepOutput>>;

/// Handed to every step callable
#[derive(Clone)]
pub struct StepContext {
    pub step: StepIndex,
    pub iteration: u64,
    pub vu: u32,
    pub worker: u16,
    graph: Arc<StepGraph>,
    outputs: Arc<Outputs>,
    clients: Arc<ClientSet>,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
}

impl StepContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        step: StepIndex,
        iteration: u64,
        vu: u32,
        worker: u16,
        graph: Arc<StepGraph>,
        outputs: Arc<Outputs>,
        clients: Arc<ClientSet>,
        events: mpsc::UnboundedSender<Event>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            step,
            iteration,
            vu,
            worker,
            graph,
            outputs,
            clients,
            events,
            cancel,
        }
    }

    pub fn step_name(&self) -> &str {
        self.graph.name(self.step)
    }

    /// Output of a completed predecessor (or earlier step of this VU)
    pub fn output(&self, step: &str) -> Option<&StepOutput> {
        let index = self.graph.index_of(step)?;
        self.outputs.get(&index).map(|o| o.as_ref())
    }

    /// This worker's protocol clients
    pub fn clients(&self) -> &Arc<ClientSet> {
        &self.clients
    }

    /// Add `value` to the custom metric `name` of this step
    pub fn record(&self, name: &str, value: f64) {
        let _ = self.events.send(Event::Metric {
            step: self.step,
            name: name.to_string(),
            value,
        });
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Validated, immutable workflow
pub struct Workflow {
    name: String,
    options: WorkflowOptions,
    steps: Vec<Step>,
    graph: Arc<StepGraph>,
    arrival: Option<Distribution>,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            options: WorkflowOptions::default(),
            steps: Vec::new(),
            arrival: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, index: StepIndex) -> &Step {
        &self.steps[index.get()]
    }

    pub fn graph(&self) -> &Arc<StepGraph> {
        &self.graph
    }

    /// Inter-arrival jitter for `constant-arrival`
    pub fn arrival(&self) -> Option<Distribution> {
        self.arrival
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn weights(&self) -> Vec<u32> {
        self.steps.iter().map(|s| s.settings.weight).collect()
    }

    pub fn rate_limits(&self) -> Vec<(StepIndex, RateLimit)> {
        self.steps
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.settings.rate_limit.map(|l| (StepIndex(i), l)))
            .collect()
    }

    /// Same steps under different options
    pub fn with_options(self, options: WorkflowOptions) -> Result<Self, SurgeError> {
        options.validate()?;
        Ok(Self { options, ..self })
    }

    /// Apply `key=value` overrides on top of the current options
    pub fn with_overrides<'a>(
        self,
        overrides: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, SurgeError> {
        let mut options = self.options.clone();
        for (key, value) in overrides {
            options.set(key, value)?;
        }
        self.with_options(options)
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("steps", &self.steps)
            .finish()
    }
}

pub struct WorkflowBuilder {
    name: String,
    options: WorkflowOptions,
    steps: Vec<Step>,
    arrival: Option<Distribution>,
}

impl WorkflowBuilder {
    pub fn options(mut self, options: WorkflowOptions) -> Self {
        self.options = options;
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn arrival(mut self, distribution: Distribution) -> Self {
        self.arrival = Some(distribution);
        self
    }

    pub fn build(self) -> Result<Workflow, SurgeError> {
        self.options.validate()?;
        let nodes: Vec<StepNode> = self
            .steps
            .iter()
            .map(|s| StepNode {
                name: s.name.clone(),
                predecessors: s.predecessors.clone(),
            })
            .collect();
        let graph = StepGraph::build(&nodes)?;
        if !self.steps.is_empty() && self.steps.iter().all(|s| s.settings.weight == 0) {
            return Err(SurgeError::InvalidOption {
                option: "weight".into(),
                reason: "at least one step needs a positive weight".into(),
            });
        }
        tracing::debug!(
            workflow = %self.name,
            steps = self.steps.len(),
            layers = graph.layers().len(),
            "workflow built"
        );
        Ok(Workflow {
            name: self.name,
            options: self.options,
            steps: self.steps,
            graph: Arc::new(graph),
            arrival: self.arrival,
        })
    }
}
