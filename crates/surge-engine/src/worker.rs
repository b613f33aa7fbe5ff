//! # Workers
//!
//! Each worker is an OS thread running its own single-threaded reactor with
//! a private [`ClientSet`] (pools, DNS cache). The coordinator feeds it
//! [`Token`]s over a bounded queue; the worker answers on the shared event
//! channel with one [`Event::Result`] per step and one [`Event::Finished`]
//! per token.
//!
//! ```text
//!   coordinator ──Token──► queue ──► worker thread (current_thread runtime)
//!                                        │  semaphore (VU share)
//!                                        ▼
//!                               run_token: DAG over the token's scope
//!                                 a ──► b ─┐
//!                                 └───► c ─┴─► d
//!                                        │
//!   coordinator ◄──Event::{Result, Metric, Finished}──┘
//! ```
//!
//! Tokens still queued when the run is cancelled are answered with
//! `ErrCancelled` results for every step in their scope, so the number of
//! results always equals the number of dispatched step operations.

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use surge_core::{
    OpContext, OpResult, ProtocolKind, Request, StepGraph, StepIndex, SurgeError, TaskKind,
};
use surge_protocols::{ClientConfig, ClientSet, DnsCache, Outcome};

use crate::rate_limit::StepLimiter;
use crate::workflow::{ActionFn, Hook, Outputs, StepContext, StepOutput, TaskFn, Workflow};

/// Which part of the graph a token runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Every step, in dependency order
    Graph,
    /// One topological layer; its steps are independent
    Layer(usize),
    /// A single step
    Step(StepIndex),
}

impl Scope {
    pub fn steps(&self, graph: &StepGraph) -> Vec<StepIndex> {
        match *self {
            Self::Graph => (0..graph.len()).map(StepIndex).collect(),
            Self::Layer(layer) => graph.layers().get(layer).cloned().unwrap_or_default(),
            Self::Step(step) if step.get() < graph.len() => vec![step],
            Self::Step(_) => Vec::new(),
        }
    }

    /// Step operations one token of this scope produces
    pub fn size(&self, graph: &StepGraph) -> usize {
        match *self {
            Self::Graph => graph.len(),
            Self::Layer(layer) => graph.layers().get(layer).map_or(0, Vec::len),
            Self::Step(step) => usize::from(step.get() < graph.len()),
        }
    }
}

/// One unit of dispatch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token {
    pub scope: Scope,
    /// Dispatch sequence number across the whole run
    pub seq: u64,
    pub iteration: u64,
    pub vu: u32,
}

impl Token {
    /// VU slot and iteration follow from the sequence number
    pub fn new(scope: Scope, seq: u64, vus: u32) -> Self {
        let vus = u64::from(vus.max(1));
        Self {
            scope,
            seq,
            iteration: seq / vus,
            vu: (seq % vus) as u32,
        }
    }

    /// Worker owning this token's VU
    pub fn worker(&self, threads: u16) -> u16 {
        (self.vu % u32::from(threads.max(1))) as u16
    }
}

/// What workers report back to the coordinator
#[derive(Debug)]
pub enum Event {
    Result(OpResult),
    /// A custom metric contribution from a step
    Metric {
        step: StepIndex,
        name: String,
        value: f64,
    },
    /// Every step of a token has produced its result
    Finished { worker: u16, vu: u32, steps: usize },
}

/// Coordinator's end of a running worker
pub(crate) struct WorkerHandle {
    pub id: u16,
    pub tokens: mpsc::Sender<Token>,
    pub thread: JoinHandle<()>,
}

/// Everything a worker thread needs besides its own clients
pub(crate) struct WorkerPlan {
    pub id: u16,
    /// VUs owned by this worker
    pub vus: usize,
    pub client: ClientConfig,
    pub queue_depth: usize,
    pub workflow: Arc<Workflow>,
    pub limiter: Arc<StepLimiter>,
    pub epoch: Instant,
    pub cancel: CancellationToken,
    pub events: mpsc::UnboundedSender<Event>,
}

/// Start a worker thread.
///
/// The returned receiver resolves once the worker's runtime and clients are
/// built, or with the error that prevented it.
pub(crate) fn spawn(
    plan: WorkerPlan,
) -> Result<(WorkerHandle, oneshot::Receiver<Result<(), SurgeError>>), SurgeError> {
    let (tx, rx) = mpsc::channel(plan.queue_depth.max(1));
    let (ready_tx, ready_rx) = oneshot::channel();
    let id = plan.id;

    let thread = std::thread::Builder::new()
        .name(format!("surge-worker-{id}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(SurgeError::Internal(format!(
                        "worker {id} runtime: {e}"
                    ))));
                    return;
                }
            };
            runtime.block_on(async move {
                let worker = match Worker::new(plan) {
                    Ok(worker) => Arc::new(worker),
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                worker.serve(rx).await;
            });
        })
        .map_err(|e| SurgeError::Internal(format!("spawn worker {id}: {e}")))?;

    Ok((
        WorkerHandle {
            id,
            tokens: tx,
            thread,
        },
        ready_rx,
    ))
}

struct Worker {
    id: u16,
    vus: usize,
    workflow: Arc<Workflow>,
    names: Vec<Arc<str>>,
    clients: Arc<ClientSet>,
    limiter: Arc<StepLimiter>,
    /// Latest outputs per VU, visible to later tokens of the same VU
    carry: DashMap<u32, Outputs>,
    epoch: Instant,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<Event>,
}

impl Worker {
    fn new(plan: WorkerPlan) -> Result<Self, SurgeError> {
        let mut client = plan.client;
        client.pool_size = client.pool_size.max(plan.vus);
        let dns = Arc::new(DnsCache::system(client.dns_ttl));
        let clients = Arc::new(ClientSet::new(client, dns)?);
        let names = plan
            .workflow
            .steps()
            .iter()
            .map(|s| Arc::<str>::from(s.name()))
            .collect();

        Ok(Self {
            id: plan.id,
            vus: plan.vus.max(1),
            workflow: plan.workflow,
            names,
            clients,
            limiter: plan.limiter,
            carry: DashMap::new(),
            epoch: plan.epoch,
            cancel: plan.cancel,
            events: plan.events,
        })
    }

    async fn serve(self: Arc<Self>, mut tokens: mpsc::Receiver<Token>) {
        let tracker = TaskTracker::new();
        let permits = Arc::new(Semaphore::new(self.vus));
        tracing::debug!(worker = self.id, vus = self.vus, "worker started");

        loop {
            let token = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                token = tokens.recv() => match token {
                    Some(token) => token,
                    None => break,
                },
            };
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.abandon(token);
                    break;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.abandon(token);
                        break;
                    }
                },
            };
            let worker = self.clone();
            tracker.spawn(async move {
                worker.run_token(token).await;
                drop(permit);
            });
        }

        tokens.close();
        while let Some(token) = tokens.recv().await {
            self.abandon(token);
        }
        tracker.close();
        tracker.wait().await;
        self.clients.close().await;
        tracing::debug!(worker = self.id, "worker stopped");
    }

    fn context(&self, step: StepIndex, token: &Token) -> OpContext {
        OpContext {
            epoch: self.epoch,
            cancel: self.cancel.clone(),
            step,
            step_name: self.names[step.get()].clone(),
            iteration: token.iteration,
            vu: token.vu,
            worker: self.id,
        }
    }

    fn emit(&self, event: Event) {
        // Closed only during teardown.
        let _ = self.events.send(event);
    }

    /// Answer a token that will never run
    fn abandon(&self, token: Token) {
        let steps = token.scope.steps(self.workflow.graph());
        for &step in &steps {
            let protocol = self.workflow.step(step).protocol();
            let result = self
                .context(step, &token)
                .recorder(protocol, "")
                .fail(SurgeError::Cancelled);
            self.emit(Event::Result(result));
        }
        self.emit(Event::Finished {
            worker: self.id,
            vu: token.vu,
            steps: steps.len(),
        });
    }

    /// Run the token's scope; a step starts once all its in-scope parents
    /// have produced a result.
    async fn run_token(&self, token: Token) {
        let graph = self.workflow.graph().clone();
        let scope = token.scope.steps(&graph);
        let mut waiting: HashMap<StepIndex, usize> = scope
            .iter()
            .map(|&step| {
                let parents = graph.parents(step);
                let in_scope = parents.iter().filter(|p| scope.contains(p)).count();
                (step, in_scope)
            })
            .collect();

        let mut outputs = self
            .carry
            .get(&token.vu)
            .map(|o| o.value().clone())
            .unwrap_or_default();

        let mut running = FuturesUnordered::new();
        for &step in &scope {
            if waiting.get(&step) == Some(&0) {
                running.push(self.run_step(step, token, Arc::new(outputs.clone())));
            }
        }

        while let Some((step, output)) = running.next().await {
            outputs.insert(step, Arc::new(output));
            for child in graph.children(step) {
                let Some(count) = waiting.get_mut(&child) else {
                    continue;
                };
                *count -= 1;
                if *count == 0 {
                    running.push(self.run_step(child, token, Arc::new(outputs.clone())));
                }
            }
        }

        self.carry.insert(token.vu, outputs);
        self.emit(Event::Finished {
            worker: self.id,
            vu: token.vu,
            steps: scope.len(),
        });
    }

    async fn run_step(
        &self,
        step: StepIndex,
        token: Token,
        outputs: Arc<Outputs>,
    ) -> (StepIndex, StepOutput) {
        let step_def = self.workflow.step(step);
        let ctx = self.context(step, &token);

        let admitted = if self.cancel.is_cancelled() {
            Err(SurgeError::Cancelled)
        } else {
            self.limiter.admit(step, step_def.name(), &self.cancel).await
        };

        let (result, output) = match (admitted, step_def.hook()) {
            (Err(e), hook) => {
                let protocol = match hook {
                    Hook::Action { protocol, .. } => Some(*protocol),
                    Hook::Task { .. } => None,
                };
                failed(ctx.recorder(protocol, "").fail(e))
            }
            (Ok(()), Hook::Action { protocol, handler }) => {
                let step_ctx = self.step_context(step, &token, outputs);
                self.run_action(&ctx, step_ctx, *protocol, handler).await
            }
            (Ok(()), Hook::Task { kind, handler }) => {
                let step_ctx = self.step_context(step, &token, outputs);
                self.run_task(&ctx, step_ctx, *kind, handler).await
            }
        };

        self.emit(Event::Result(result));
        (step, output)
    }

    fn step_context(&self, step: StepIndex, token: &Token, outputs: Arc<Outputs>) -> StepContext {
        StepContext::new(
            step,
            token.iteration,
            token.vu,
            self.id,
            self.workflow.graph().clone(),
            outputs,
            self.clients.clone(),
            self.events.clone(),
            self.cancel.clone(),
        )
    }

    async fn build_request(
        &self,
        step_ctx: StepContext,
        handler: &ActionFn,
    ) -> Result<Request, SurgeError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SurgeError::Cancelled),
            request = handler(step_ctx) => request.map_err(hook_error),
        }
    }

    async fn run_action(
        &self,
        ctx: &OpContext,
        step_ctx: StepContext,
        protocol: ProtocolKind,
        handler: &ActionFn,
    ) -> (OpResult, StepOutput) {
        let settings = self.workflow.step(ctx.step).settings();
        let mut request = match self.build_request(step_ctx, handler).await {
            Ok(request) => request,
            Err(e) => return failed(ctx.recorder(Some(protocol), "").fail(e)),
        };
        if request.timeout.is_none() {
            request.timeout = settings.timeout;
        }
        if let Some(redirects) = settings.redirects {
            request.redirects = redirects;
        }

        let mut attempt = 0;
        loop {
            let outcome = self.clients.execute(protocol, &request, ctx).await;
            let retryable = outcome
                .result
                .error_kind()
                .is_some_and(|kind| kind.is_retryable());
            if !retryable || attempt >= settings.retries || self.cancel.is_cancelled() {
                return completed(outcome);
            }
            attempt += 1;
            tracing::debug!(
                step = %ctx.step_name,
                attempt,
                error = ?outcome.result.error_kind(),
                "retrying step"
            );
        }
    }

    async fn run_task(
        &self,
        ctx: &OpContext,
        step_ctx: StepContext,
        kind: TaskKind,
        handler: &TaskFn,
    ) -> (OpResult, StepOutput) {
        let rec = ctx.recorder(None, "");
        let limit = self.workflow.step(ctx.step).settings().timeout;
        let task = handler(step_ctx);
        let guarded = async {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(value) => value.map_err(hook_error),
                    Err(_) => Err(SurgeError::Timeout(limit)),
                },
                None => task.await.map_err(hook_error),
            }
        };
        let value = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SurgeError::Cancelled),
            value = guarded => value,
        };

        match value {
            Ok(value) => {
                if kind == TaskKind::Metric {
                    self.record_metrics(ctx, &value);
                }
                let output = StepOutput {
                    value,
                    ..StepOutput::default()
                };
                (rec.finish(None, None), output)
            }
            Err(e) => failed(rec.fail(e)),
        }
    }

    /// A metric task contributes a bare number under its own name, or every
    /// numeric field of an object
    fn record_metrics(&self, ctx: &OpContext, value: &Value) {
        match value {
            Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    self.emit(Event::Metric {
                        step: ctx.step,
                        name: ctx.step_name.to_string(),
                        value: v,
                    });
                }
            }
            Value::Object(fields) => {
                for (name, field) in fields {
                    if let Some(v) = field.as_f64() {
                        self.emit(Event::Metric {
                            step: ctx.step,
                            name: name.clone(),
                            value: v,
                        });
                    }
                }
            }
            _ => {}
        }
    }
}

fn hook_error(err: anyhow::Error) -> SurgeError {
    SurgeError::Protocol(format!("step hook failed: {err:#}"))
}

fn failed(result: OpResult) -> (OpResult, StepOutput) {
    let output = StepOutput {
        error: result.error.clone(),
        ..StepOutput::default()
    };
    (result, output)
}

fn completed(outcome: Outcome) -> (OpResult, StepOutput) {
    let Outcome { result, response } = outcome;
    let output = match response {
        Some(response) => StepOutput {
            status: Some(response.status),
            headers: response.headers,
            body: response.body,
            value: Value::Null,
            error: result.error.clone(),
        },
        None => StepOutput {
            status: result.status,
            error: result.error.clone(),
            ..StepOutput::default()
        },
    };
    (result, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Step;
    use std::time::Duration;
    use surge_core::ErrorKind;

    fn plan(
        workflow: Workflow,
        cancel: CancellationToken,
    ) -> (WorkerPlan, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let workflow = Arc::new(workflow);
        let plan = WorkerPlan {
            id: 0,
            vus: 2,
            client: ClientConfig::default(),
            queue_depth: 8,
            limiter: Arc::new(StepLimiter::new(workflow.rate_limits())),
            workflow,
            epoch: Instant::now(),
            cancel,
            events,
        };
        (plan, rx)
    }

    fn sleeper(name: &str, millis: u64) -> Step {
        Step::task(name, TaskKind::Transform, move |_| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(Value::Null)
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> (Vec<OpResult>, usize) {
        let mut results = Vec::new();
        let mut finished = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Result(r) => results.push(r),
                Event::Finished { .. } => finished += 1,
                Event::Metric { .. } => {}
            }
        }
        (results, finished)
    }

    #[test]
    fn test_token_slots() {
        let token = Token::new(Scope::Graph, 7, 3);
        assert_eq!(token.vu, 1);
        assert_eq!(token.iteration, 2);
        assert_eq!(token.worker(2), 1);
        assert_eq!(Token::new(Scope::Graph, 5, 0).vu, 0);
    }

    #[test]
    fn test_scope_sizes() {
        let wf = Workflow::builder("w")
            .step(sleeper("a", 0))
            .step(sleeper("b", 0).after(&["a"]))
            .step(sleeper("c", 0).after(&["a"]))
            .build()
            .unwrap();
        let graph = wf.graph();
        assert_eq!(Scope::Graph.size(graph), 3);
        assert_eq!(Scope::Layer(1).size(graph), 2);
        assert_eq!(Scope::Layer(9).size(graph), 0);
        assert_eq!(Scope::Step(StepIndex(2)).steps(graph), vec![StepIndex(2)]);
        assert_eq!(Scope::Step(StepIndex(3)).size(graph), 0);
    }

    #[tokio::test]
    async fn test_token_respects_dependencies() {
        let wf = Workflow::builder("diamond")
            .step(sleeper("a", 20))
            .step(sleeper("b", 10).after(&["a"]))
            .step(sleeper("c", 30).after(&["a"]))
            .step(sleeper("d", 5).after(&["b", "c"]))
            .build()
            .unwrap();
        let (plan, mut rx) = plan(wf, CancellationToken::new());
        let worker = Worker::new(plan).unwrap();

        worker.run_token(Token::new(Scope::Graph, 0, 2)).await;
        let (results, finished) = drain(&mut rx);
        assert_eq!(finished, 1);
        assert_eq!(results.len(), 4);

        let by_name: HashMap<&str, &OpResult> =
            results.iter().map(|r| (r.step_name.as_str(), r)).collect();
        assert!(by_name["b"].start_offset >= by_name["a"].end_offset);
        assert!(by_name["c"].start_offset >= by_name["a"].end_offset);
        assert!(by_name["d"].start_offset >= by_name["b"].end_offset);
        assert!(by_name["d"].start_offset >= by_name["c"].end_offset);
        assert!(results.iter().all(|r| r.is_success()));
    }

    #[tokio::test]
    async fn test_outputs_flow_to_successors() {
        let wf = Workflow::builder("flow")
            .step(Step::task("seed", TaskKind::Setup, |_| async {
                Ok(serde_json::json!({"user": 42}))
            }))
            .step(
                Step::task("use", TaskKind::Condition, |ctx| async move {
                    let seed = ctx
                        .output("seed")
                        .map(|o| o.value["user"].clone())
                        .unwrap_or(Value::Null);
                    anyhow::ensure!(seed == 42, "missing seed output");
                    Ok(seed)
                })
                .after(&["seed"]),
            )
            .build()
            .unwrap();
        let (plan, mut rx) = plan(wf, CancellationToken::new());
        let worker = Worker::new(plan).unwrap();

        worker.run_token(Token::new(Scope::Graph, 0, 1)).await;
        let (results, _) = drain(&mut rx);
        assert!(results.iter().all(|r| r.is_success()), "{results:?}");
    }

    #[tokio::test]
    async fn test_task_failure_is_protocol_error() {
        let wf = Workflow::builder("fail")
            .step(Step::task("boom", TaskKind::Event, |_| async {
                anyhow::bail!("exploded")
            }))
            .step(sleeper("after", 0).after(&["boom"]))
            .build()
            .unwrap();
        let (plan, mut rx) = plan(wf, CancellationToken::new());
        let worker = Worker::new(plan).unwrap();

        worker.run_token(Token::new(Scope::Graph, 0, 1)).await;
        let (results, _) = drain(&mut rx);
        assert_eq!(results.len(), 2);
        let boom = results.iter().find(|r| r.step_name == "boom").unwrap();
        assert_eq!(boom.error_kind(), Some(ErrorKind::Protocol));
        assert!(boom.error.as_ref().unwrap().message.contains("exploded"));
        let after = results.iter().find(|r| r.step_name == "after").unwrap();
        assert!(after.is_success());
    }

    #[tokio::test]
    async fn test_metric_task_records_numbers() {
        let wf = Workflow::builder("m")
            .step(Step::task("stats", TaskKind::Metric, |_| async {
                Ok(serde_json::json!({"queue_depth": 3, "label": "x", "lag": 1.5}))
            }))
            .build()
            .unwrap();
        let (plan, mut rx) = plan(wf, CancellationToken::new());
        let worker = Worker::new(plan).unwrap();

        worker.run_token(Token::new(Scope::Graph, 0, 1)).await;
        let mut metrics = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::Metric { name, value, .. } = event {
                metrics.push((name, value));
            }
        }
        metrics.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            metrics,
            vec![("lag".to_string(), 1.5), ("queue_depth".to_string(), 3.0)]
        );
    }

    #[tokio::test]
    async fn test_cancelled_token_yields_cancelled_results() {
        let cancel = CancellationToken::new();
        let wf = Workflow::builder("c")
            .step(sleeper("a", 0))
            .step(sleeper("b", 0).after(&["a"]))
            .build()
            .unwrap();
        let (plan, mut rx) = plan(wf, cancel.clone());
        let worker = Worker::new(plan).unwrap();
        cancel.cancel();

        worker.run_token(Token::new(Scope::Graph, 0, 1)).await;
        worker.abandon(Token::new(Scope::Layer(1), 1, 1));
        let (results, finished) = drain(&mut rx);
        assert_eq!(finished, 2);
        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|r| r.error_kind() == Some(ErrorKind::Cancelled)));
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let wf = Workflow::builder("t")
            .step(sleeper("slow", 500).timeout(Duration::from_millis(20)))
            .build()
            .unwrap();
        let (plan, mut rx) = plan(wf, CancellationToken::new());
        let worker = Worker::new(plan).unwrap();

        worker.run_token(Token::new(Scope::Step(StepIndex(0)), 0, 1)).await;
        let (results, _) = drain(&mut rx);
        assert_eq!(results[0].error_kind(), Some(ErrorKind::Timeout));
    }
}
