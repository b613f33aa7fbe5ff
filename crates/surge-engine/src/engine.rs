//! # Execution Engine
//!
//! Binds a persona to a workflow's step graph and drives it across worker
//! threads for the configured duration.
//!
//! ```text
//!                 ┌──────────── coordinator (caller's runtime) ────────────┐
//!   persona ────► │ next_batch ─► Token(seq) ─► worker[vu % threads]       │
//!                 │ pace: await all | await any | continue, then pause     │
//!                 │ events ─► Aggregator (+ retained results)              │
//!                 └────────────────────────────────────────────────────────┘
//!                       │ bounded queues                 ▲ unbounded events
//!                       ▼                                │
//!               worker 0 .. worker N-1 (own thread, reactor, pools, DNS)
//! ```
//!
//! A run ends when the duration elapses or the caller cancels. After the
//! duration, in-flight tokens get `drain_grace` to finish; then the run token
//! is cancelled, workers answer everything still queued with `ErrCancelled`,
//! and the coordinator collects events until every worker has hung up.
//! Every dispatched step operation yields exactly one result.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use surge_core::{OpResult, SurgeError};
use surge_protocols::ClientConfig;

use crate::aggregator::{Aggregator, MetricsSet, DEFAULT_RESERVOIR};
use crate::persona::{Feedback, Pace, PersonaPlan, MIN_TICK};
use crate::rate_limit::StepLimiter;
use crate::registry::Registry;
use crate::worker::{self, Event, Token, WorkerHandle, WorkerPlan};
use crate::workflow::Workflow;

/// Engine-wide settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Settings for every worker's protocol clients
    #[serde(default)]
    pub client: ClientConfig,

    /// Tokens buffered per worker before dispatch blocks
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Keep raw results in the report
    #[serde(default = "default_retain_results")]
    pub retain_results: bool,

    /// Latency samples kept per step for quantiles
    #[serde(default = "default_reservoir")]
    pub reservoir: usize,
}

fn default_queue_depth() -> usize {
    1024
}

fn default_retain_results() -> bool {
    true
}

fn default_reservoir() -> usize {
    DEFAULT_RESERVOIR
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            queue_depth: default_queue_depth(),
            retain_results: default_retain_results(),
            reservoir: default_reservoir(),
        }
    }
}

/// Outcome of one run
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    pub workflow: String,
    /// Raw results, in arrival order (empty when not retained)
    pub results: Vec<OpResult>,
    /// One metrics set per step, in step order
    pub metrics: Vec<MetricsSet>,
    /// Step operations dispatched
    pub dispatched: u64,
    pub elapsed: Duration,
    /// The caller stopped the run before its duration elapsed
    pub cancelled: bool,
}

impl RunReport {
    fn empty(workflow: &str) -> Self {
        Self {
            workflow: workflow.to_string(),
            ..Self::default()
        }
    }

    /// Results aggregated across every step
    pub fn total(&self) -> u64 {
        self.metrics.iter().map(|m| m.total).sum()
    }

    pub fn failed(&self) -> u64 {
        self.metrics.iter().map(|m| m.failed).sum()
    }

    pub fn metrics_for(&self, step: &str) -> Option<&MetricsSet> {
        self.metrics.iter().find(|m| m.step == step)
    }
}

/// Runs workflows
pub struct Engine {
    config: EngineConfig,
    registry: Arc<Registry>,
}

impl Engine {
    pub fn new(config: EngineConfig, registry: Arc<Registry>) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Drive `workflow` until its duration elapses or `cancel` fires.
    ///
    /// Only load-time problems (unknown persona, invalid options, worker
    /// startup) are returned as `Err`; operation failures are in the report.
    pub async fn run(
        &self,
        workflow: Arc<Workflow>,
        cancel: CancellationToken,
    ) -> Result<RunReport, SurgeError> {
        let opts = workflow.options().clone();
        opts.validate()?;
        let mut persona = self.registry.persona(&PersonaPlan::for_workflow(&workflow))?;

        if workflow.is_empty() || opts.duration.is_zero() {
            tracing::info!(workflow = %workflow.name(), "nothing to run");
            return Ok(RunReport::empty(workflow.name()));
        }

        let threads = opts.threads.max(1);
        let run_cancel = cancel.child_token();
        let limiter = Arc::new(StepLimiter::new(workflow.rate_limits()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let epoch = std::time::Instant::now();

        let mut workers = Vec::with_capacity(threads as usize);
        let mut pending = Vec::with_capacity(threads as usize);
        for id in 0..threads {
            let plan = WorkerPlan {
                id,
                vus: vu_share(opts.vus, threads, id),
                client: self.config.client.clone(),
                queue_depth: self.config.queue_depth,
                workflow: workflow.clone(),
                limiter: limiter.clone(),
                epoch,
                cancel: run_cancel.clone(),
                events: events_tx.clone(),
            };
            let (handle, ready) = worker::spawn(plan)?;
            workers.push(handle);
            pending.push(ready);
        }
        drop(events_tx);

        for ready in pending {
            let started = match ready.await {
                Ok(started) => started,
                Err(_) => Err(SurgeError::Internal("worker exited during startup".into())),
            };
            if let Err(e) = started {
                run_cancel.cancel();
                tracing::error!(error = %e, "worker startup failed");
                return Err(e);
            }
        }

        tracing::info!(
            workflow = %workflow.name(),
            persona = %persona.kind(),
            vus = opts.vus,
            threads,
            duration = ?opts.duration,
            "run started"
        );

        let steps = workflow.steps().iter().map(|s| s.name());
        let mut collector = Collector {
            events: events_rx,
            aggregator: Aggregator::new(workflow.name(), steps, self.config.reservoir),
            results: Vec::new(),
            retain: self.config.retain_results,
            in_flight: 0,
            finished: 0,
            closed: false,
        };

        let started = Instant::now();
        let deadline = started + opts.duration;
        let graph = workflow.graph().clone();
        let mut seq: u64 = 0;
        let mut dispatched: u64 = 0;

        'run: while !run_cancel.is_cancelled() && Instant::now() < deadline && !collector.closed {
            let feedback = Feedback {
                elapsed: started.elapsed(),
                in_flight: collector.in_flight,
                dispatched: seq,
            };
            let batch = persona.next_batch(&feedback);

            for scope in &batch.scopes {
                let token = Token::new(*scope, seq, opts.vus);
                let worker = &workers[token.worker(threads) as usize];
                tokio::select! {
                    biased;
                    _ = run_cancel.cancelled() => break 'run,
                    _ = tokio::time::sleep_until(deadline) => break 'run,
                    sent = worker.tokens.send(token) => {
                        if sent.is_err() {
                            tracing::warn!(worker = worker.id, "worker queue closed");
                            break 'run;
                        }
                    }
                }
                seq += 1;
                dispatched += scope.size(&graph) as u64;
                collector.in_flight += 1;
            }

            let paced = match batch.pace {
                Pace::AwaitAll => {
                    collector
                        .pump_until(|c| c.in_flight == 0, deadline, &run_cancel)
                        .await
                }
                Pace::AwaitAny if collector.in_flight > 0 => {
                    let target = collector.finished + 1;
                    collector
                        .pump_until(|c| c.finished >= target, deadline, &run_cancel)
                        .await
                }
                Pace::AwaitAny | Pace::Continue => true,
            };
            if !paced {
                break;
            }

            let mut pause = batch.pause;
            if batch.scopes.is_empty() && pause.is_zero() && collector.in_flight == 0 {
                pause = MIN_TICK;
            }
            if !pause.is_zero() {
                let until = (Instant::now() + pause).min(deadline);
                collector.pump_until(|_| false, until, &run_cancel).await;
            }
        }

        if !run_cancel.is_cancelled() && collector.in_flight > 0 {
            let grace = Instant::now() + opts.drain_grace;
            tracing::debug!(in_flight = collector.in_flight, "draining");
            collector
                .pump_until(|c| c.in_flight == 0, grace, &run_cancel)
                .await;
        }
        run_cancel.cancel();

        let threads: Vec<_> = workers
            .into_iter()
            .map(|WorkerHandle { thread, .. }| thread)
            .collect();
        collector.finish().await;
        for thread in threads {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                _ => tracing::error!("worker thread panicked"),
            }
        }

        let elapsed = started.elapsed();
        let metrics = collector.aggregator.finalize(elapsed);
        let report = RunReport {
            workflow: workflow.name().to_string(),
            results: collector.results,
            metrics,
            dispatched,
            elapsed,
            cancelled: cancel.is_cancelled(),
        };
        tracing::info!(
            workflow = %report.workflow,
            dispatched = report.dispatched,
            total = report.total(),
            failed = report.failed(),
            elapsed = ?report.elapsed,
            cancelled = report.cancelled,
            "run finished"
        );
        Ok(report)
    }
}

/// VUs owned by worker `id` under round-robin assignment (at least one)
fn vu_share(vus: u32, threads: u16, id: u16) -> usize {
    let threads = u32::from(threads.max(1));
    let base = vus / threads;
    let extra = u32::from(u32::from(id) < vus % threads);
    (base + extra).max(1) as usize
}

/// Coordinator side of the event channel
struct Collector {
    events: mpsc::UnboundedReceiver<Event>,
    aggregator: Aggregator,
    results: Vec<OpResult>,
    retain: bool,
    in_flight: usize,
    finished: u64,
    closed: bool,
}

impl Collector {
    fn apply(&mut self, event: Event) {
        match event {
            Event::Result(result) => {
                self.aggregator.add(&result);
                if self.retain {
                    self.results.push(result);
                }
            }
            Event::Metric { step, name, value } => {
                self.aggregator.add_custom(step, &name, value);
            }
            Event::Finished { .. } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.finished += 1;
            }
        }
    }

    /// Apply events until `done` holds. Returns false if `until` passes, the
    /// run is cancelled, or every worker has hung up first.
    async fn pump_until(
        &mut self,
        done: impl Fn(&Self) -> bool,
        until: Instant,
        cancel: &CancellationToken,
    ) -> bool {
        while !done(self) {
            if self.closed {
                return false;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                event = self.events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => self.closed = true,
                },
                _ = tokio::time::sleep_until(until) => return false,
            }
        }
        true
    }

    /// Apply everything workers still send, until all have hung up
    async fn finish(&mut self) {
        while let Some(event) = self.events.recv().await {
            self.apply(event);
        }
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vu_share() {
        assert_eq!(vu_share(10, 3, 0), 4);
        assert_eq!(vu_share(10, 3, 1), 3);
        assert_eq!(vu_share(10, 3, 2), 3);
        assert_eq!(vu_share(1, 4, 3), 1);
        let total: usize = (0..4).map(|id| vu_share(17, 4, id)).sum();
        assert_eq!(total, 17);
    }

    #[test]
    fn test_engine_config_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.queue_depth, 1024);
        assert!(config.retain_results);
        assert_eq!(config.reservoir, DEFAULT_RESERVOIR);
        assert_eq!(config.client.pool_size, 64);
    }
}
