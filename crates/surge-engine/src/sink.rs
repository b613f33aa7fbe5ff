//! # Sinks
//!
//! A sink receives finalized [`MetricsSet`]s and, if it asks for them, raw
//! [`OpResult`]s. The [`SinkDispatcher`] fans a batch out to every sink
//! concurrently; calls into one sink are strictly sequential.
//!
//! ```text
//!                      ┌──► console      (box table)
//!   RunReport ──► SinkDispatcher ──► json-file    (JSON lines)
//!                      ├──► prometheus   (gauges, text exposition)
//!                      └──► memory       (tests)
//! ```
//!
//! A failing sink is logged and skipped; it never aborts the run or the
//! other sinks.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use prometheus::{Encoder, GaugeVec, Opts, Registry as PromRegistry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use surge_core::{ErrorKind, OpResult, SurgeError};

use crate::aggregator::{MetricsSet, QUANTILES};
use crate::engine::RunReport;

/// Sink failures; all of them classify as `ErrSinkUnavailable`
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink `{sink}` is not connected")]
    NotConnected { sink: String },

    #[error("sink `{sink}` I/O error: {source}")]
    Io {
        sink: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sink `{sink}` could not encode batch: {reason}")]
    Encode { sink: String, reason: String },

    #[error("sink `{sink}` rejected batch: {reason}")]
    Rejected { sink: String, reason: String },

    #[error("unknown sink kind: {0}")]
    UnknownKind(String),
}

impl SinkError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SinkUnavailable
    }

    pub fn sink(&self) -> &str {
        match self {
            Self::NotConnected { sink }
            | Self::Io { sink, .. }
            | Self::Encode { sink, .. }
            | Self::Rejected { sink, .. } => sink,
            Self::UnknownKind(kind) => kind,
        }
    }
}

impl From<SinkError> for SurgeError {
    fn from(err: SinkError) -> Self {
        SurgeError::SinkUnavailable {
            sink: err.sink().to_string(),
            reason: err.to_string(),
        }
    }
}

/// One delivery
#[derive(Clone, Copy, Debug)]
pub enum SinkBatch<'a> {
    Metrics(&'a [MetricsSet]),
    Results(&'a [OpResult]),
}

/// Destination for run output. Calls are never concurrent on one sink.
#[async_trait]
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Whether raw results should be submitted as well as metrics
    fn wants_results(&self) -> bool {
        false
    }

    async fn connect(&mut self) -> Result<(), SinkError>;

    async fn submit(&mut self, batch: SinkBatch<'_>) -> Result<(), SinkError>;

    async fn close(&mut self) -> Result<(), SinkError>;
}

/// Declarative sink description, resolved through the registry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Factory name: `console`, `json-file`, `prometheus`, `memory`, ...
    pub kind: String,

    /// Output file for file-backed sinks
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Also deliver raw results
    #[serde(default)]
    pub include_results: bool,

    /// Metric name prefix for `prometheus`
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "surge".to_string()
}

impl SinkConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            path: None,
            include_results: false,
            namespace: default_namespace(),
        }
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

struct Slot {
    sink: Box<dyn Sink>,
    connected: bool,
    failures: u64,
}

/// Fan-out over every configured sink
pub struct SinkDispatcher {
    slots: Vec<Slot>,
}

impl SinkDispatcher {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        let slots = sinks
            .into_iter()
            .map(|sink| Slot {
                sink,
                connected: false,
                failures: 0,
            })
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Connect every sink; returns how many are usable
    pub async fn connect(&mut self) -> usize {
        join_all(self.slots.iter_mut().map(|slot| async move {
            match slot.sink.connect().await {
                Ok(()) => slot.connected = true,
                Err(e) => {
                    slot.failures += 1;
                    tracing::error!(
                        sink = slot.sink.name(),
                        kind = %e.kind(),
                        error = %e,
                        "sink connect failed"
                    );
                }
            }
        }))
        .await;
        self.slots.iter().filter(|s| s.connected).count()
    }

    /// Deliver one batch to every connected sink
    pub async fn submit(&mut self, batch: SinkBatch<'_>) -> Vec<SinkError> {
        let outcomes = join_all(
            self.slots
                .iter_mut()
                .filter(|slot| slot.connected)
                .filter(|slot| {
                    matches!(batch, SinkBatch::Metrics(_)) || slot.sink.wants_results()
                })
                .map(|slot| async move {
                    let res = slot.sink.submit(batch).await;
                    if let Err(e) = &res {
                        slot.failures += 1;
                        tracing::error!(
                            sink = slot.sink.name(),
                            kind = %e.kind(),
                            error = %e,
                            "sink submit failed"
                        );
                    }
                    res
                }),
        )
        .await;
        outcomes.into_iter().filter_map(Result::err).collect()
    }

    /// Metrics, then raw results to the sinks that want them
    pub async fn deliver(&mut self, report: &RunReport) -> Vec<SinkError> {
        let mut errors = self.submit(SinkBatch::Metrics(&report.metrics)).await;
        if !report.results.is_empty() {
            errors.extend(self.submit(SinkBatch::Results(&report.results)).await);
        }
        errors
    }

    /// Close every connected sink
    pub async fn close(&mut self) -> Vec<SinkError> {
        let outcomes = join_all(
            self.slots
                .iter_mut()
                .filter(|slot| slot.connected)
                .map(|slot| async move {
                    slot.connected = false;
                    let res = slot.sink.close().await;
                    if let Err(e) = &res {
                        slot.failures += 1;
                        tracing::warn!(sink = slot.sink.name(), error = %e, "sink close failed");
                    }
                    res
                }),
        )
        .await;
        outcomes.into_iter().filter_map(Result::err).collect()
    }

    /// Failure count per sink, in configuration order
    pub fn failures(&self) -> Vec<(&str, u64)> {
        self.slots
            .iter()
            .map(|slot| (slot.sink.name(), slot.failures))
            .collect()
    }
}

// ============================================================================
// CONSOLE
// ============================================================================

const WIDTH: usize = 62;

/// Box-drawn table per step
pub struct ConsoleSink {
    out: Box<dyn Write + Send>,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }
}

fn rule(left: char, right: char) -> String {
    format!("{left}{}{right}\n", "═".repeat(WIDTH))
}

fn row(label: &str, value: &str) -> String {
    let label: String = label.chars().take(WIDTH - 14).collect();
    let pad = WIDTH.saturating_sub(label.chars().count() + 2);
    format!("║ {label}{value:>pad$} ║\n")
}

/// Render one metrics set as a box table
pub fn render_metrics(set: &MetricsSet) -> String {
    let mut out = String::new();
    out.push_str(&rule('╔', '╗'));
    let title = format!("{} / {}", set.workflow, set.step);
    out.push_str(&format!("║{title:^WIDTH$}║\n"));
    out.push_str(&rule('╠', '╣'));
    out.push_str(&row("Duration (s)", &format!("{:.2}", set.elapsed_secs)));
    out.push_str(&row("Total", &set.total.to_string()));
    out.push_str(&row("Succeeded", &set.succeeded.to_string()));
    out.push_str(&row("Failed", &set.failed.to_string()));
    out.push_str(&row("Success Rate", &format!("{:.2}%", set.success_rate())));
    out.push_str(&row("Rate (ops/s)", &format!("{:.2}", set.rate)));
    out.push_str(&rule('╠', '╣'));
    out.push_str(&row("LATENCY (ms)", ""));
    out.push_str(&row("  min", &format!("{:.3}", set.min)));
    out.push_str(&row("  mean", &format!("{:.3}", set.mean)));
    out.push_str(&row("  stddev", &format!("{:.3}", set.stddev)));
    for q in [50u8, 90, 95, 99] {
        out.push_str(&row(&format!("  p{q}"), &format!("{:.3}", set.quantile(q))));
    }
    out.push_str(&row("  max", &format!("{:.3}", set.max)));
    out.push_str(&rule('╠', '╣'));
    out.push_str(&row("Bytes Sent", &set.bytes_sent.to_string()));
    out.push_str(&row("Bytes Received", &set.bytes_received.to_string()));
    if !set.errors.is_empty() {
        out.push_str(&rule('╠', '╣'));
        out.push_str(&row("ERRORS", ""));
        for (key, count) in &set.errors {
            out.push_str(&row(&format!("  {key}"), &count.to_string()));
        }
    }
    if !set.custom.is_empty() {
        out.push_str(&rule('╠', '╣'));
        out.push_str(&row("CUSTOM", ""));
        for (name, value) in &set.custom {
            out.push_str(&row(&format!("  {name}"), &format!("{value:.3}")));
        }
    }
    out.push_str(&rule('╚', '╝'));
    out
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn connect(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn submit(&mut self, batch: SinkBatch<'_>) -> Result<(), SinkError> {
        let SinkBatch::Metrics(sets) = batch else {
            return Ok(());
        };
        let io = |source| SinkError::Io {
            sink: "console".into(),
            source,
        };
        for set in sets {
            self.out
                .write_all(render_metrics(set).as_bytes())
                .map_err(io)?;
        }
        self.out.flush().map_err(io)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.out.flush().map_err(|source| SinkError::Io {
            sink: "console".into(),
            source,
        })
    }
}

// ============================================================================
// JSON LINES
// ============================================================================

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Record<'a> {
    Metrics(&'a MetricsSet),
    Result(&'a OpResult),
}

/// Appends one JSON object per line
pub struct JsonFileSink {
    path: PathBuf,
    include_results: bool,
    file: Option<tokio::fs::File>,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>, include_results: bool) -> Self {
        Self {
            path: path.into(),
            include_results,
            file: None,
        }
    }

    fn io(source: std::io::Error) -> SinkError {
        SinkError::Io {
            sink: "json-file".into(),
            source,
        }
    }
}

fn encode_line(record: &Record<'_>, buf: &mut Vec<u8>) -> Result<(), SinkError> {
    serde_json::to_writer(&mut *buf, record).map_err(|e| SinkError::Encode {
        sink: "json-file".into(),
        reason: e.to_string(),
    })?;
    buf.push(b'\n');
    Ok(())
}

#[async_trait]
impl Sink for JsonFileSink {
    fn name(&self) -> &str {
        "json-file"
    }

    fn wants_results(&self) -> bool {
        self.include_results
    }

    async fn connect(&mut self) -> Result<(), SinkError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(Self::io)?;
        self.file = Some(file);
        Ok(())
    }

    async fn submit(&mut self, batch: SinkBatch<'_>) -> Result<(), SinkError> {
        let file = self.file.as_mut().ok_or_else(|| SinkError::NotConnected {
            sink: "json-file".into(),
        })?;
        let mut buf = Vec::new();
        match batch {
            SinkBatch::Metrics(sets) => {
                for set in sets {
                    encode_line(&Record::Metrics(set), &mut buf)?;
                }
            }
            SinkBatch::Results(results) => {
                for result in results {
                    encode_line(&Record::Result(result), &mut buf)?;
                }
            }
        }
        file.write_all(&buf).await.map_err(Self::io)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(Self::io)?;
            file.sync_all().await.map_err(Self::io)?;
        }
        Ok(())
    }
}

// ============================================================================
// PROMETHEUS
// ============================================================================

/// Publishes metrics sets as gauges on its own registry
pub struct PrometheusSink {
    registry: PromRegistry,
    latency: GaugeVec,
    operations: GaugeVec,
    throughput: GaugeVec,
    errors: GaugeVec,
    custom: GaugeVec,
    /// Text exposition is written here on close
    path: Option<PathBuf>,
}

impl PrometheusSink {
    pub fn new(namespace: &str, path: Option<PathBuf>) -> Result<Self, SinkError> {
        let prom = |e: prometheus::Error| SinkError::Rejected {
            sink: "prometheus".into(),
            reason: e.to_string(),
        };
        let gauge = |name: &str, help: &str, labels: &[&str]| {
            GaugeVec::new(Opts::new(name, help).namespace(namespace), labels).map_err(prom)
        };

        let latency = gauge(
            "latency_ms",
            "Step latency summary in milliseconds",
            &["workflow", "step", "quantile"],
        )?;
        let operations = gauge(
            "operations",
            "Step operations by outcome",
            &["workflow", "step", "outcome"],
        )?;
        let throughput = gauge(
            "throughput",
            "Step operations per second",
            &["workflow", "step"],
        )?;
        let errors = gauge(
            "errors",
            "Failed operations by error",
            &["workflow", "step", "error"],
        )?;
        let custom = gauge(
            "custom",
            "User-recorded step metrics",
            &["workflow", "step", "name"],
        )?;

        let registry = PromRegistry::new();
        for vec in [&latency, &operations, &throughput, &errors, &custom] {
            registry.register(Box::new(vec.clone())).map_err(prom)?;
        }

        Ok(Self {
            registry,
            latency,
            operations,
            throughput,
            errors,
            custom,
            path,
        })
    }

    pub fn registry(&self) -> &PromRegistry {
        &self.registry
    }

    /// Current text exposition
    pub fn render(&self) -> Result<String, SinkError> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| SinkError::Encode {
                sink: "prometheus".into(),
                reason: e.to_string(),
            })?;
        String::from_utf8(buf).map_err(|e| SinkError::Encode {
            sink: "prometheus".into(),
            reason: e.to_string(),
        })
    }

    fn publish(&self, set: &MetricsSet) {
        let (wf, step) = (set.workflow.as_str(), set.step.as_str());
        for q in QUANTILES {
            let label = format!("p{q}");
            self.latency
                .with_label_values(&[wf, step, &label])
                .set(set.quantile(q));
        }
        for (label, value) in [("min", set.min), ("mean", set.mean), ("max", set.max)] {
            self.latency.with_label_values(&[wf, step, label]).set(value);
        }
        for (outcome, value) in [
            ("total", set.total),
            ("succeeded", set.succeeded),
            ("failed", set.failed),
        ] {
            self.operations
                .with_label_values(&[wf, step, outcome])
                .set(value as f64);
        }
        self.throughput.with_label_values(&[wf, step]).set(set.rate);
        for (error, count) in &set.errors {
            self.errors
                .with_label_values(&[wf, step, error])
                .set(*count as f64);
        }
        for (name, value) in &set.custom {
            self.custom.with_label_values(&[wf, step, name]).set(*value);
        }
    }
}

#[async_trait]
impl Sink for PrometheusSink {
    fn name(&self) -> &str {
        "prometheus"
    }

    async fn connect(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn submit(&mut self, batch: SinkBatch<'_>) -> Result<(), SinkError> {
        if let SinkBatch::Metrics(sets) = batch {
            for set in sets {
                self.publish(set);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = self.render()?;
        tokio::fs::write(path, text)
            .await
            .map_err(|source| SinkError::Io {
                sink: "prometheus".into(),
                source,
            })
    }
}

// ============================================================================
// MEMORY
// ============================================================================

/// Keeps everything it receives; clones share the same storage
#[derive(Clone, Default)]
pub struct MemorySink {
    metrics: Arc<Mutex<Vec<MetricsSet>>>,
    results: Arc<Mutex<Vec<OpResult>>>,
    closed: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> Vec<MetricsSet> {
        self.metrics.lock().clone()
    }

    pub fn results(&self) -> Vec<OpResult> {
        self.results.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn wants_results(&self) -> bool {
        true
    }

    async fn connect(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn submit(&mut self, batch: SinkBatch<'_>) -> Result<(), SinkError> {
        match batch {
            SinkBatch::Metrics(sets) => self.metrics.lock().extend_from_slice(sets),
            SinkBatch::Results(results) => self.results.lock().extend_from_slice(results),
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        *self.closed.lock() = true;
        Ok(())
    }
}
