//! # Personas
//!
//! A persona turns duration, VUs and the step graph into a stream of
//! dispatch batches. The coordinator asks for the next [`Batch`] and tells
//! the persona how the run is going through [`Feedback`].
//!
//! ```text
//!   closed loop   default, batched, sequenced, ramped, weighted
//!                   send batch ─► await all ─► pause ─► next batch
//!   spawn         constant-spawn
//!                   top up to VUs ─► await any ─► top up
//!   open loop     constant-arrival, ramped-interval, no-wait
//!                   send batch ─► pause ─► next batch  (completions ignored)
//! ```
//!
//! `constant-arrival` spreads a continuous rate over discrete ticks with a
//! fractional carry, so the long-run average matches the requested rate:
//!
//! ```text
//!   due   = rate * tick + carry
//!   count = floor(due)
//!   carry = due - count
//! ```

use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

use surge_core::{PersonaKind, StepIndex, SurgeError, WorkflowOptions};

use crate::distribution::Distribution;
use crate::worker::Scope;
use crate::workflow::Workflow;

/// Shortest tick the arrival governor runs at
pub const MIN_TICK: Duration = Duration::from_millis(10);

/// What the coordinator waits for after sending a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pace {
    /// Until every dispatched token has finished
    AwaitAll,
    /// Until at least one token finishes
    AwaitAny,
    /// Nothing; go straight to the pause
    Continue,
}

/// One round of dispatch
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub scopes: Vec<Scope>,
    pub pace: Pace,
    /// Sleep before asking for the next batch
    pub pause: Duration,
}

impl Batch {
    fn of(scope: Scope, count: usize, pace: Pace, pause: Duration) -> Self {
        Self {
            scopes: vec![scope; count],
            pace,
            pause,
        }
    }
}

/// Run state visible to a persona
#[derive(Clone, Copy, Debug, Default)]
pub struct Feedback {
    pub elapsed: Duration,
    /// Tokens dispatched but not yet finished
    pub in_flight: usize,
    /// Tokens dispatched so far
    pub dispatched: u64,
}

/// Stateful producer of dispatch batches for one run
pub trait Persona: Send {
    fn kind(&self) -> PersonaKind;

    fn next_batch(&mut self, feedback: &Feedback) -> Batch;
}

/// What a persona may know about the workflow it shapes
#[derive(Clone, Debug)]
pub struct PersonaPlan {
    pub options: WorkflowOptions,
    pub layers: usize,
    /// Step indices in topological order
    pub order: Vec<StepIndex>,
    pub weights: Vec<u32>,
    pub arrival: Option<Distribution>,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl PersonaPlan {
    pub fn for_workflow(workflow: &Workflow) -> Self {
        let graph = workflow.graph();
        Self {
            options: workflow.options().clone(),
            layers: graph.layers().len(),
            order: graph.layers().iter().flatten().copied().collect(),
            weights: workflow.weights(),
            arrival: workflow.arrival(),
            seed: None,
        }
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// Constructor stored in the registry
pub type PersonaFactory = fn(&PersonaPlan) -> Result<Box<dyn Persona>, SurgeError>;

/// Build the persona named by `plan.options.persona`
pub fn build_persona(plan: &PersonaPlan) -> Result<Box<dyn Persona>, SurgeError> {
    let opts = &plan.options;
    let persona: Box<dyn Persona> = match opts.persona {
        PersonaKind::Default => Box::new(Closed {
            kind: PersonaKind::Default,
            size: opts.batch(),
            pause: Duration::ZERO,
        }),
        PersonaKind::Batched => Box::new(Closed {
            kind: PersonaKind::Batched,
            size: opts.batch(),
            pause: opts.batch_interval,
        }),
        PersonaKind::Sequenced => Box::new(Sequenced {
            size: opts.batch(),
            layers: plan.layers,
            next: 0,
        }),
        PersonaKind::Ramped => Box::new(Ramped::new(opts)?),
        PersonaKind::RampedInterval => Box::new(RampedInterval {
            size: opts.batch(),
            interval: opts.batch_interval,
            factor: opts.interval_factor,
            floor: opts.interval_min,
        }),
        PersonaKind::ConstantArrival => Box::new(ConstantArrival::new(plan)?),
        PersonaKind::ConstantSpawn => Box::new(ConstantSpawn {
            vus: opts.vus.max(1) as usize,
        }),
        PersonaKind::Weighted => Box::new(Weighted::new(plan)?),
        PersonaKind::NoWait => Box::new(NoWait {
            size: opts.batch(),
            empty: plan.order.is_empty(),
        }),
    };
    Ok(persona)
}

/// `default` and `batched`: whole-graph batches, awaited
struct Closed {
    kind: PersonaKind,
    size: usize,
    pause: Duration,
}

impl Persona for Closed {
    fn kind(&self) -> PersonaKind {
        self.kind
    }

    fn next_batch(&mut self, _: &Feedback) -> Batch {
        Batch::of(Scope::Graph, self.size, Pace::AwaitAll, self.pause)
    }
}

/// One layer at a time, cycling through the graph
struct Sequenced {
    size: usize,
    layers: usize,
    next: usize,
}

impl Persona for Sequenced {
    fn kind(&self) -> PersonaKind {
        PersonaKind::Sequenced
    }

    fn next_batch(&mut self, _: &Feedback) -> Batch {
        if self.layers == 0 {
            return Batch::of(Scope::Graph, 0, Pace::AwaitAll, Duration::ZERO);
        }
        let layer = self.next;
        self.next = (self.next + 1) % self.layers;
        Batch::of(Scope::Layer(layer), self.size, Pace::AwaitAll, Duration::ZERO)
    }
}

/// Batch grows by `gradient` after every interval, up to `cap`
struct Ramped {
    current: usize,
    gradient: usize,
    cap: usize,
    pause: Duration,
}

impl Ramped {
    fn new(opts: &WorkflowOptions) -> Result<Self, SurgeError> {
        let start = if opts.batch_size > 0 {
            opts.batch_size
        } else {
            opts.batch_gradient
        };
        if start == 0 {
            return Err(SurgeError::InvalidOption {
                option: "batch_gradient".into(),
                reason: "ramped persona needs a positive batch_size or batch_gradient".into(),
            });
        }
        let cap = opts.batch_cap().max(1);
        Ok(Self {
            current: start.min(cap),
            gradient: opts.batch_gradient,
            cap,
            pause: opts.batch_interval,
        })
    }
}

impl Persona for Ramped {
    fn kind(&self) -> PersonaKind {
        PersonaKind::Ramped
    }

    fn next_batch(&mut self, _: &Feedback) -> Batch {
        let size = self.current;
        self.current = (self.current + self.gradient).min(self.cap);
        Batch::of(Scope::Graph, size, Pace::AwaitAll, self.pause)
    }
}

/// Fixed batch, open loop; the gap shrinks by `factor` down to `floor`
struct RampedInterval {
    size: usize,
    interval: Duration,
    factor: f64,
    floor: Duration,
}

impl Persona for RampedInterval {
    fn kind(&self) -> PersonaKind {
        PersonaKind::RampedInterval
    }

    fn next_batch(&mut self, _: &Feedback) -> Batch {
        let pause = self.interval;
        self.interval = self.interval.mul_f64(self.factor).max(self.floor);
        Batch::of(Scope::Graph, self.size, Pace::Continue, pause)
    }
}

/// Open-loop arrivals at a fixed average rate
struct ConstantArrival {
    per_second: f64,
    tick: Duration,
    carry: f64,
    arrival: Option<Distribution>,
    rng: StdRng,
}

impl ConstantArrival {
    fn new(plan: &PersonaPlan) -> Result<Self, SurgeError> {
        let opts = &plan.options;
        let (per_second, spacing) = match opts.rate {
            Some(rate) => (rate.per_second(), rate.spacing()),
            None => {
                let per = opts.batch_interval.max(MIN_TICK);
                let count = opts.batch() as f64;
                (count / per.as_secs_f64(), per.div_f64(count.max(1.0)))
            }
        };
        if !per_second.is_finite() || per_second <= 0.0 {
            return Err(SurgeError::InvalidOption {
                option: "rate".into(),
                reason: "constant-arrival needs a positive rate".into(),
            });
        }
        Ok(Self {
            per_second,
            tick: spacing.max(MIN_TICK),
            carry: 0.0,
            arrival: plan.arrival,
            rng: plan.rng(),
        })
    }
}

impl Persona for ConstantArrival {
    fn kind(&self) -> PersonaKind {
        PersonaKind::ConstantArrival
    }

    fn next_batch(&mut self, _: &Feedback) -> Batch {
        // With an arrival distribution every token gets its own sampled gap.
        if let Some(arrival) = self.arrival {
            let gap = arrival.sample_duration(&mut self.rng);
            return Batch::of(Scope::Graph, 1, Pace::Continue, gap);
        }
        let due = self.per_second * self.tick.as_secs_f64() + self.carry;
        let count = due.floor();
        self.carry = due - count;
        Batch::of(Scope::Graph, count as usize, Pace::Continue, self.tick)
    }
}

/// Keep `vus` tokens in flight, replacing each one as it finishes
struct ConstantSpawn {
    vus: usize,
}

impl Persona for ConstantSpawn {
    fn kind(&self) -> PersonaKind {
        PersonaKind::ConstantSpawn
    }

    fn next_batch(&mut self, feedback: &Feedback) -> Batch {
        let missing = self.vus.saturating_sub(feedback.in_flight);
        Batch::of(Scope::Graph, missing, Pace::AwaitAny, Duration::ZERO)
    }
}

/// Single steps picked by declared weight
struct Weighted {
    size: usize,
    index: Option<WeightedIndex<u32>>,
    rng: StdRng,
}

impl Weighted {
    fn new(plan: &PersonaPlan) -> Result<Self, SurgeError> {
        let index = if plan.weights.is_empty() {
            None
        } else {
            Some(WeightedIndex::new(&plan.weights).map_err(|e| {
                SurgeError::InvalidOption {
                    option: "weight".into(),
                    reason: e.to_string(),
                }
            })?)
        };
        Ok(Self {
            size: plan.options.batch(),
            index,
            rng: plan.rng(),
        })
    }
}

impl Persona for Weighted {
    fn kind(&self) -> PersonaKind {
        PersonaKind::Weighted
    }

    fn next_batch(&mut self, _: &Feedback) -> Batch {
        let scopes = match &self.index {
            Some(index) => (0..self.size)
                .map(|_| Scope::Step(StepIndex(self.rng.sample(index))))
                .collect(),
            None => Vec::new(),
        };
        Batch {
            scopes,
            pace: Pace::AwaitAll,
            pause: Duration::ZERO,
        }
    }
}

/// Whole-graph iterations, open loop, as fast as the worker queues
/// accept them
struct NoWait {
    size: usize,
    empty: bool,
}

impl Persona for NoWait {
    fn kind(&self) -> PersonaKind {
        PersonaKind::NoWait
    }

    fn next_batch(&mut self, _: &Feedback) -> Batch {
        let size = if self.empty { 0 } else { self.size };
        Batch::of(Scope::Graph, size, Pace::Continue, Duration::ZERO)
    }
}
