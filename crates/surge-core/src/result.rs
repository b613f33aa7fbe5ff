//! Per-operation result records
//!
//! An [`OpRecorder`] travels with an operation and collects phase marks,
//! byte counts and connection accounting. [`OpRecorder::finish`] seals it
//! into an [`OpResult`], which is never mutated afterwards.
//!
//! ```text
//!  start ─ dns ─ connect ─ tls ─ write ─ first_byte ─ read ─ total
//!          (cumulative offsets from start, non-decreasing)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, SurgeError};
use crate::types::{ProtocolKind, StepIndex};

/// Measured phases of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Dns = 0,
    Connect = 1,
    Tls = 2,
    Write = 3,
    FirstByte = 4,
    Read = 5,
}

const PHASES: usize = 6;

/// Cumulative phase offsets measured from the operation start
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phases {
    pub dns: Duration,
    pub connect: Duration,
    pub tls: Duration,
    pub write: Duration,
    pub first_byte: Duration,
    pub read: Duration,
    pub total: Duration,
}

impl Phases {
    /// Check the ordering dns ≤ connect ≤ tls ≤ write ≤ first_byte ≤ read ≤ total
    pub fn is_monotone(&self) -> bool {
        let seq = [
            self.dns,
            self.connect,
            self.tls,
            self.write,
            self.first_byte,
            self.read,
            self.total,
        ];
        seq.windows(2).all(|w| w[0] <= w[1])
    }
}

/// Failure attached to a result
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Key under which this failure is counted in error histograms
    pub fn histogram_key(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }
}

impl From<&SurgeError> for OpError {
    fn from(err: &SurgeError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<SurgeError> for OpError {
    fn from(err: SurgeError) -> Self {
        Self::from(&err)
    }
}

/// Immutable record of one executed (or abandoned) step operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    pub step: StepIndex,
    pub step_name: String,
    /// `None` for task steps
    pub protocol: Option<ProtocolKind>,
    pub url: String,
    pub iteration: u64,
    pub vu: u32,
    pub worker: u16,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Monotonic offset of the start from the run epoch
    pub start_offset: Duration,
    /// Monotonic offset of the end from the run epoch
    pub end_offset: Duration,
    pub phases: Phases,
    pub status: Option<u16>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error: Option<OpError>,
    /// Number of dials performed, across redirects and retries
    pub connects: u32,
    /// Sum of all dial durations
    pub connect_time: Duration,
    pub redirects: u32,
}

impl OpResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.map_or(true, |s| s < 400)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Histogram key for a failed result
    pub fn failure_key(&self) -> Option<String> {
        match (&self.error, self.status) {
            (Some(err), _) => Some(err.histogram_key()),
            (None, Some(status)) if status >= 400 => Some(format!("HTTP {status}")),
            _ => None,
        }
    }

    pub fn latency(&self) -> Duration {
        self.phases.total
    }
}

/// Everything an operation needs to know about where it runs
#[derive(Clone, Debug)]
pub struct OpContext {
    /// Monotonic start of the run
    pub epoch: Instant,
    /// Run-level cancellation signal
    pub cancel: CancellationToken,
    pub step: StepIndex,
    pub step_name: Arc<str>,
    pub iteration: u64,
    pub vu: u32,
    pub worker: u16,
}

impl OpContext {
    pub fn new(step: StepIndex, step_name: impl Into<Arc<str>>) -> Self {
        Self {
            epoch: Instant::now(),
            cancel: CancellationToken::new(),
            step,
            step_name: step_name.into(),
            iteration: 0,
            vu: 0,
            worker: 0,
        }
    }

    pub fn recorder(&self, protocol: Option<ProtocolKind>, url: &str) -> OpRecorder {
        OpRecorder::new(self, protocol, url)
    }
}

/// Mutable collector sealed into an [`OpResult`]
#[derive(Debug)]
pub struct OpRecorder {
    step: StepIndex,
    step_name: Arc<str>,
    protocol: Option<ProtocolKind>,
    url: String,
    iteration: u64,
    vu: u32,
    worker: u16,
    epoch: Instant,
    started: Instant,
    started_at: DateTime<Utc>,
    marks: [Option<Duration>; PHASES],
    bytes_sent: u64,
    bytes_received: u64,
    connects: u32,
    connect_time: Duration,
    redirects: u32,
}

impl OpRecorder {
    pub fn new(ctx: &OpContext, protocol: Option<ProtocolKind>, url: &str) -> Self {
        Self {
            step: ctx.step,
            step_name: ctx.step_name.clone(),
            protocol,
            url: url.to_string(),
            iteration: ctx.iteration,
            vu: ctx.vu,
            worker: ctx.worker,
            epoch: ctx.epoch,
            started: Instant::now(),
            started_at: Utc::now(),
            marks: [None; PHASES],
            bytes_sent: 0,
            bytes_received: 0,
            connects: 0,
            connect_time: Duration::ZERO,
            redirects: 0,
        }
    }

    /// Record that `phase` completed now
    pub fn mark(&mut self, phase: Phase) {
        self.marks[phase as usize] = Some(self.started.elapsed());
    }

    /// Record a completed dial that began at `began`
    pub fn connected(&mut self, began: Instant) {
        self.connects += 1;
        self.connect_time += began.elapsed();
        self.mark(Phase::Connect);
    }

    pub fn sent(&mut self, n: usize) {
        self.bytes_sent += n as u64;
    }

    pub fn received(&mut self, n: usize) {
        self.bytes_received += n as u64;
    }

    /// Record a followed redirect and the URL now being requested
    pub fn redirected(&mut self, url: &str) {
        self.redirects += 1;
        self.url = url.to_string();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Seal the record
    pub fn finish(self, status: Option<u16>, error: Option<OpError>) -> OpResult {
        let ended = Instant::now();
        let total = ended.duration_since(self.started);

        // Carry missing phases forward and clamp to a non-decreasing sequence.
        let mut offsets = [Duration::ZERO; PHASES];
        let mut floor = Duration::ZERO;
        for (slot, mark) in offsets.iter_mut().zip(self.marks.iter()) {
            floor = floor.max(mark.unwrap_or(floor)).min(total);
            *slot = floor;
        }

        OpResult {
            step: self.step,
            step_name: self.step_name.to_string(),
            protocol: self.protocol,
            url: self.url,
            iteration: self.iteration,
            vu: self.vu,
            worker: self.worker,
            started_at: self.started_at,
            ended_at: Utc::now(),
            start_offset: self.started.saturating_duration_since(self.epoch),
            end_offset: ended.saturating_duration_since(self.epoch),
            phases: Phases {
                dns: offsets[0],
                connect: offsets[1],
                tls: offsets[2],
                write: offsets[3],
                first_byte: offsets[4],
                read: offsets[5],
                total,
            },
            status,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            error,
            connects: self.connects,
            connect_time: self.connect_time,
            redirects: self.redirects,
        }
    }

    pub fn fail(self, err: impl Into<OpError>) -> OpResult {
        self.finish(None, Some(err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_phases_carry_forward() {
        let ctx = OpContext::new(StepIndex(0), "g");
        let mut rec = ctx.recorder(Some(ProtocolKind::Http1), "http://x.test/");
        rec.mark(Phase::Write);
        std::thread::sleep(Duration::from_millis(2));
        rec.mark(Phase::FirstByte);
        let result = rec.finish(Some(200), None);

        assert!(result.phases.is_monotone());
        assert_eq!(result.phases.dns, Duration::ZERO);
        assert_eq!(result.phases.tls, Duration::ZERO);
        assert_eq!(result.phases.read, result.phases.first_byte);
        assert!(result.phases.first_byte > Duration::ZERO);
        assert!(result.is_success());
    }

    #[test]
    fn test_out_of_order_marks_are_clamped() {
        let ctx = OpContext::new(StepIndex(1), "r");
        let mut rec = ctx.recorder(None, "");
        rec.mark(Phase::Write);
        std::thread::sleep(Duration::from_millis(2));
        // A redirect hop re-resolves after the first write
        rec.mark(Phase::Dns);
        let result = rec.finish(None, None);
        assert!(result.phases.is_monotone());
        assert!(result.phases.write >= result.phases.dns);
    }

    #[test]
    fn test_connect_time_sums() {
        let ctx = OpContext::new(StepIndex(0), "g");
        let mut rec = ctx.recorder(Some(ProtocolKind::Http1), "http://a.test/");
        let began = Instant::now();
        rec.connected(began);
        rec.redirected("https://a.test/");
        rec.connected(Instant::now());
        let result = rec.finish(Some(200), None);
        assert_eq!(result.connects, 2);
        assert_eq!(result.redirects, 1);
        assert_eq!(result.url, "https://a.test/");
    }

    #[test]
    fn test_failure_keys() {
        let ctx = OpContext::new(StepIndex(0), "g");
        let failed = ctx
            .recorder(None, "")
            .fail(OpError::new(ErrorKind::Cancelled, "operation cancelled"));
        assert!(!failed.is_success());
        assert_eq!(
            failed.failure_key().as_deref(),
            Some("ErrCancelled: operation cancelled")
        );

        let not_found = ctx.recorder(None, "").finish(Some(404), None);
        assert!(!not_found.is_success());
        assert_eq!(not_found.failure_key().as_deref(), Some("HTTP 404"));
    }
}
