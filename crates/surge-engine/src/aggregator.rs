//! # Result Aggregation
//!
//! Folds [`OpResult`]s into one [`MetricsSet`] per step.
//!
//! ```text
//!   OpResult ──► StepAggregate::add ──► counters, exact sums, error histogram
//!                        │
//!                        └──► bottom-k reservoir (blake3 priority)
//!   finalize(elapsed) ──► MetricsSet (immutable)
//! ```
//!
//! Counters and moments are exact (`u128` sums). Quantiles come from a
//! bounded reservoir that keeps the `k` samples with the smallest blake3
//! priority. The priority is a hash of the result itself, so the kept set
//! depends only on the multiset of results, never on arrival order, and
//! merging worker-local aggregates in any order gives the same answer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use surge_core::{OpResult, StepIndex};

/// Quantiles reported for every step
pub const QUANTILES: [u8; 13] = [10, 20, 25, 30, 40, 50, 60, 70, 75, 80, 90, 95, 99];

/// Default number of latency samples kept per step
pub const DEFAULT_RESERVOIR: usize = 4096;

/// Mean time at which each phase completed, in milliseconds from operation start
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseMeans {
    pub dns: f64,
    pub connect: f64,
    pub tls: f64,
    pub write: f64,
    pub first_byte: f64,
    pub read: f64,
}

/// Finalized statistics for one step; timings are in milliseconds
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSet {
    pub workflow: String,
    pub step: String,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Operations per second over the run
    pub rate: f64,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    pub quantiles: BTreeMap<u8, f64>,
    pub phases: PhaseMeans,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Failure key (`ErrTimeout: ...`, `HTTP 503`) to count
    pub errors: BTreeMap<String, u64>,
    /// User-contributed metrics, summed
    pub custom: BTreeMap<String, f64>,
    pub elapsed_secs: f64,
}

impl MetricsSet {
    pub fn quantile(&self, q: u8) -> f64 {
        self.quantiles.get(&q).copied().unwrap_or(0.0)
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64 * 100.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Sample {
    priority: u64,
    latency_ns: u64,
}

fn priority(result: &OpResult) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(result.step_name.as_bytes());
    hasher.update(&result.vu.to_le_bytes());
    hasher.update(&result.worker.to_le_bytes());
    hasher.update(&result.iteration.to_le_bytes());
    hasher.update(&(result.start_offset.as_nanos() as u64).to_le_bytes());
    hasher.update(&(result.phases.total.as_nanos() as u64).to_le_bytes());
    hasher.update(&result.status.unwrap_or(0).to_le_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// Running aggregate for one step
#[derive(Clone, Debug)]
pub struct StepAggregate {
    step: String,
    capacity: usize,
    total: u64,
    succeeded: u64,
    failed: u64,
    bytes_sent: u64,
    bytes_received: u64,
    latency_sum: u128,
    latency_sq_sum: u128,
    phase_sums: [u128; 6],
    min_ns: u64,
    max_ns: u64,
    reservoir: BTreeMap<Sample, u32>,
    held: usize,
    errors: BTreeMap<String, u64>,
    custom: BTreeMap<String, f64>,
}

impl StepAggregate {
    pub fn new(step: impl Into<String>, capacity: usize) -> Self {
        Self {
            step: step.into(),
            capacity: capacity.max(1),
            total: 0,
            succeeded: 0,
            failed: 0,
            bytes_sent: 0,
            bytes_received: 0,
            latency_sum: 0,
            latency_sq_sum: 0,
            phase_sums: [0; 6],
            min_ns: u64::MAX,
            max_ns: 0,
            reservoir: BTreeMap::new(),
            held: 0,
            errors: BTreeMap::new(),
            custom: BTreeMap::new(),
        }
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn add(&mut self, result: &OpResult) {
        self.total += 1;
        match result.failure_key() {
            None => self.succeeded += 1,
            Some(key) => {
                self.failed += 1;
                *self.errors.entry(key).or_insert(0) += 1;
            }
        }
        self.bytes_sent += result.bytes_sent;
        self.bytes_received += result.bytes_received;

        let latency = result.phases.total.as_nanos() as u64;
        self.latency_sum += latency as u128;
        self.latency_sq_sum += (latency as u128) * (latency as u128);
        self.min_ns = self.min_ns.min(latency);
        self.max_ns = self.max_ns.max(latency);

        let p = &result.phases;
        for (sum, phase) in self
            .phase_sums
            .iter_mut()
            .zip([p.dns, p.connect, p.tls, p.write, p.first_byte, p.read])
        {
            *sum += phase.as_nanos();
        }

        self.offer(
            Sample {
                priority: priority(result),
                latency_ns: latency,
            },
            1,
        );
    }

    pub fn add_custom(&mut self, name: &str, value: f64) {
        *self.custom.entry(name.to_string()).or_insert(0.0) += value;
    }

    /// Keep the `capacity` smallest samples of the multiset seen so far
    fn offer(&mut self, sample: Sample, count: u32) {
        for _ in 0..count {
            if self.held < self.capacity {
                *self.reservoir.entry(sample).or_insert(0) += 1;
                self.held += 1;
                continue;
            }
            let largest = match self.reservoir.keys().next_back() {
                Some(largest) if sample < *largest => *largest,
                _ => return,
            };
            if let Some(n) = self.reservoir.get_mut(&largest) {
                *n -= 1;
                if *n == 0 {
                    self.reservoir.remove(&largest);
                }
            }
            *self.reservoir.entry(sample).or_insert(0) += 1;
        }
    }

    /// Fold another aggregate of the same step into this one
    pub fn merge(&mut self, other: &StepAggregate) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.latency_sum += other.latency_sum;
        self.latency_sq_sum += other.latency_sq_sum;
        for (mine, theirs) in self.phase_sums.iter_mut().zip(other.phase_sums) {
            *mine += theirs;
        }
        self.min_ns = self.min_ns.min(other.min_ns);
        self.max_ns = self.max_ns.max(other.max_ns);
        for (sample, count) in &other.reservoir {
            self.offer(*sample, *count);
        }
        for (key, count) in &other.errors {
            *self.errors.entry(key.clone()).or_insert(0) += count;
        }
        for (name, value) in &other.custom {
            *self.custom.entry(name.clone()).or_insert(0.0) += value;
        }
    }

    pub fn finalize(&self, workflow: &str, elapsed: Duration) -> MetricsSet {
        let mut set = MetricsSet {
            workflow: workflow.to_string(),
            step: self.step.clone(),
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            errors: self.errors.clone(),
            custom: self.custom.clone(),
            elapsed_secs: elapsed.as_secs_f64(),
            quantiles: QUANTILES.iter().map(|q| (*q, 0.0)).collect(),
            ..Default::default()
        };
        if self.total == 0 {
            return set;
        }

        let n = self.total as u128;
        let to_ms = |ns: f64| ns / 1e6;
        set.rate = if elapsed.is_zero() {
            0.0
        } else {
            self.total as f64 / elapsed.as_secs_f64()
        };
        set.mean = to_ms(self.latency_sum as f64 / n as f64);
        let variance_ns2 = n
            .checked_mul(self.latency_sq_sum)
            .and_then(|a| a.checked_sub(self.latency_sum.checked_mul(self.latency_sum)?))
            .map(|num| num as f64 / (n as f64 * n as f64))
            .unwrap_or_else(|| {
                let mean = self.latency_sum as f64 / n as f64;
                (self.latency_sq_sum as f64 / n as f64 - mean * mean).max(0.0)
            });
        set.variance = variance_ns2 / 1e12;
        set.stddev = set.variance.sqrt();
        set.min = to_ms(self.min_ns as f64);
        set.max = to_ms(self.max_ns as f64);

        let phase_means: Vec<f64> = self
            .phase_sums
            .iter()
            .map(|sum| to_ms(*sum as f64 / n as f64))
            .collect();
        set.phases = PhaseMeans {
            dns: phase_means[0],
            connect: phase_means[1],
            tls: phase_means[2],
            write: phase_means[3],
            first_byte: phase_means[4],
            read: phase_means[5],
        };

        let mut sorted: Vec<u64> = Vec::with_capacity(self.held);
        for (sample, count) in &self.reservoir {
            sorted.extend(std::iter::repeat(sample.latency_ns).take(*count as usize));
        }
        sorted.sort_unstable();
        for q in QUANTILES {
            set.quantiles
                .insert(q, to_ms(interpolate(&sorted, q as f64 / 100.0)));
        }
        set.median = set.quantile(50);
        set
    }
}

/// Linear interpolation at position `q * (n - 1)` of a sorted sample
pub fn interpolate(sorted: &[u64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0] as f64,
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] as f64 + (sorted[hi] as f64 - sorted[lo] as f64) * frac
        }
    }
}

/// Run-level aggregator: one [`StepAggregate`] per step, addressed by index
#[derive(Clone, Debug)]
pub struct Aggregator {
    workflow: String,
    steps: Vec<StepAggregate>,
}

impl Aggregator {
    pub fn new<'a>(
        workflow: impl Into<String>,
        steps: impl IntoIterator<Item = &'a str>,
        capacity: usize,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            steps: steps
                .into_iter()
                .map(|name| StepAggregate::new(name, capacity))
                .collect(),
        }
    }

    pub fn add(&mut self, result: &OpResult) {
        match self.steps.get_mut(result.step.get()) {
            Some(step) => step.add(result),
            None => tracing::warn!(step = %result.step, "result for unknown step dropped"),
        }
    }

    pub fn add_custom(&mut self, step: StepIndex, name: &str, value: f64) {
        if let Some(agg) = self.steps.get_mut(step.get()) {
            agg.add_custom(name, value);
        }
    }

    pub fn merge(&mut self, other: &Aggregator) {
        for (mine, theirs) in self.steps.iter_mut().zip(&other.steps) {
            mine.merge(theirs);
        }
    }

    pub fn total(&self) -> u64 {
        self.steps.iter().map(|s| s.total()).sum()
    }

    pub fn step(&self, step: StepIndex) -> Option<&StepAggregate> {
        self.steps.get(step.get())
    }

    /// Finalized sets in step order
    pub fn finalize(&self, elapsed: Duration) -> Vec<MetricsSet> {
        self.steps
            .iter()
            .map(|s| s.finalize(&self.workflow, elapsed))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use surge_core::{ErrorKind, OpError, Phases, ProtocolKind};

    fn result(vu: u32, iteration: u64, latency_ms: u64, status: Option<u16>) -> OpResult {
        let total = Duration::from_millis(latency_ms);
        OpResult {
            step: StepIndex(0),
            step_name: "g".into(),
            protocol: Some(ProtocolKind::Http1),
            url: "http://a.test/".into(),
            iteration,
            vu,
            worker: 0,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            start_offset: Duration::from_millis(iteration * 10),
            end_offset: Duration::from_millis(iteration * 10) + total,
            phases: Phases {
                write: total / 4,
                first_byte: total / 2,
                read: total,
                total,
                ..Default::default()
            },
            status,
            bytes_sent: 10,
            bytes_received: 100,
            error: None,
            connects: 1,
            connect_time: Duration::ZERO,
            redirects: 0,
        }
    }

    #[test]
    fn test_empty_sample_is_all_zero() {
        let agg = StepAggregate::new("g", 16);
        let set = agg.finalize("wf", Duration::from_secs(1));
        assert_eq!(set.total, 0);
        assert_eq!(set.failed, set.total);
        assert_eq!(set.mean, 0.0);
        assert_eq!(set.quantiles.len(), QUANTILES.len());
        assert!(set.quantiles.values().all(|v| *v == 0.0));
    }

    #[test]
    fn test_counts_and_moments() {
        let mut agg = StepAggregate::new("g", 16);
        for (i, ms) in [10u64, 20, 30, 40].iter().enumerate() {
            agg.add(&result(0, i as u64, *ms, Some(200)));
        }
        let mut failed = result(1, 0, 50, None);
        failed.error = Some(OpError::new(ErrorKind::Timeout, "Timed out after 50ms"));
        agg.add(&failed);
        agg.add(&result(2, 0, 60, Some(503)));

        let set = agg.finalize("wf", Duration::from_secs(2));
        assert_eq!(set.total, 6);
        assert_eq!(set.succeeded, 4);
        assert_eq!(set.failed, 2);
        assert_eq!(set.total, set.succeeded + set.failed);
        assert_eq!(set.rate, 3.0);
        assert!((set.mean - 35.0).abs() < 1e-9);
        assert_eq!(set.min, 10.0);
        assert_eq!(set.max, 60.0);
        // population variance of 10..60 step 10
        assert!((set.variance - 291.666_666).abs() < 1e-3);
        assert!((set.median - 35.0).abs() < 1e-9);
        assert_eq!(set.errors.get("HTTP 503"), Some(&1));
        assert_eq!(
            set.errors.get("ErrTimeout: Timed out after 50ms"),
            Some(&1)
        );
        assert_eq!(set.bytes_received, 600);
    }

    #[test]
    fn test_interpolation() {
        let sorted = [10, 20, 30, 40];
        assert_eq!(interpolate(&sorted, 0.0), 10.0);
        assert_eq!(interpolate(&sorted, 1.0), 40.0);
        assert!((interpolate(&sorted, 0.5) - 25.0).abs() < 1e-9);
        assert!((interpolate(&sorted, 0.9) - 37.0).abs() < 1e-9);
        assert_eq!(interpolate(&[7], 0.99), 7.0);
    }

    #[test]
    fn test_reservoir_is_bounded() {
        let mut agg = StepAggregate::new("g", 8);
        for i in 0..100 {
            agg.add(&result(0, i, i + 1, Some(200)));
        }
        assert_eq!(agg.held, 8);
        assert_eq!(agg.reservoir.values().map(|c| *c as usize).sum::<usize>(), 8);
        let set = agg.finalize("wf", Duration::from_secs(1));
        assert_eq!(set.total, 100);
        assert_eq!(set.min, 1.0);
        assert_eq!(set.max, 100.0);
    }

    #[test]
    fn test_custom_metrics_and_merge() {
        let mut a = Aggregator::new("wf", ["g", "h"], 16);
        let mut b = Aggregator::new("wf", ["g", "h"], 16);
        a.add(&result(0, 0, 5, Some(200)));
        b.add(&result(1, 0, 7, Some(200)));
        a.add_custom(StepIndex(1), "items", 2.0);
        b.add_custom(StepIndex(1), "items", 3.0);
        a.merge(&b);

        let sets = a.finalize(Duration::from_secs(1));
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].total, 2);
        assert_eq!(sets[1].custom.get("items"), Some(&5.0));
        assert_eq!(a.total(), 2);
    }

    fn build(samples: &[(u32, u64, Option<u16>)]) -> Vec<OpResult> {
        samples
            .iter()
            .enumerate()
            .map(|(i, (vu, ms, status))| result(*vu, i as u64, *ms, *status))
            .collect()
    }

    proptest! {
        #[test]
        fn prop_add_order_is_irrelevant(
            samples in prop::collection::vec(
                (
                    0u32..4,
                    0u64..500,
                    prop::option::of(prop::sample::select(vec![200u16, 404, 500])),
                ),
                0..64,
            ),
            seed in any::<u64>(),
        ) {
            let results = build(&samples);
            let mut shuffled = results.clone();
            let n = shuffled.len();
            if n > 1 {
                let mut s = seed;
                for i in (1..n).rev() {
                    s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    shuffled.swap(i, (s >> 33) as usize % (i + 1));
                }
            }

            let mut forward = StepAggregate::new("g", 8);
            let mut backward = StepAggregate::new("g", 8);
            results.iter().for_each(|r| forward.add(r));
            shuffled.iter().for_each(|r| backward.add(r));

            let elapsed = Duration::from_secs(3);
            prop_assert_eq!(forward.finalize("wf", elapsed), backward.finalize("wf", elapsed));
        }

        #[test]
        fn prop_quantiles_are_monotone(latencies in prop::collection::vec(0u64..10_000, 1..200)) {
            let mut agg = StepAggregate::new("g", 64);
            for (i, ms) in latencies.iter().enumerate() {
                agg.add(&result(0, i as u64, *ms, Some(200)));
            }
            let set = agg.finalize("wf", Duration::from_secs(1));
            let values: Vec<f64> = QUANTILES.iter().map(|q| set.quantile(*q)).collect();
            prop_assert!(values.windows(2).all(|w| w[0] <= w[1]));
            prop_assert!(set.min <= values[0]);
            prop_assert!(values[values.len() - 1] <= set.max);
            prop_assert_eq!(set.total, set.succeeded + set.failed);
        }
    }
}
