//! Workflow options
//!
//! Recognized knobs: `vus`, `threads`, `duration`, `persona`, `batch_size`,
//! `batch_interval`, `rate`, plus the shaping parameters the ramping
//! personas read. Durations are written as `"250ms"`, `"5s"`, `"1m"` or
//! compounds like `"1h30m"`; rates as `"100/1s"` or `"20/s"`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SurgeError};

/// Load-shaping strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PersonaKind {
    #[default]
    Default,
    Batched,
    Sequenced,
    Ramped,
    RampedInterval,
    ConstantArrival,
    ConstantSpawn,
    Weighted,
    NoWait,
}

impl PersonaKind {
    pub const ALL: [PersonaKind; 9] = [
        Self::Default,
        Self::Batched,
        Self::Sequenced,
        Self::Ramped,
        Self::RampedInterval,
        Self::ConstantArrival,
        Self::ConstantSpawn,
        Self::Weighted,
        Self::NoWait,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Batched => "batched",
            Self::Sequenced => "sequenced",
            Self::Ramped => "ramped",
            Self::RampedInterval => "ramped-interval",
            Self::ConstantArrival => "constant-arrival",
            Self::ConstantSpawn => "constant-spawn",
            Self::Weighted => "weighted",
            Self::NoWait => "no-wait",
        }
    }
}

impl fmt::Display for PersonaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PersonaKind {
    type Err = SurgeError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| SurgeError::UnknownPersona(s.to_string()))
    }
}

impl Serialize for PersonaKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PersonaKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// `count` operations per `per`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rate {
    pub count: u32,
    pub per: Duration,
}

impl Rate {
    pub fn per_second(&self) -> f64 {
        if self.per.is_zero() {
            return f64::INFINITY;
        }
        self.count as f64 / self.per.as_secs_f64()
    }

    /// Spacing between consecutive operations at this rate
    pub fn spacing(&self) -> Duration {
        if self.count == 0 {
            return self.per;
        }
        self.per / self.count
    }
}

impl FromStr for Rate {
    type Err = SurgeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| SurgeError::InvalidOption {
            option: "rate".into(),
            reason: format!("`{s}`: {reason}"),
        };
        let (count, per) = s.split_once('/').ok_or_else(|| invalid("expected N/T"))?;
        let count = count
            .trim()
            .parse::<u32>()
            .map_err(|_| invalid("count is not an integer"))?;
        let per = per.trim();
        let per = if per.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            parse_duration(per)?
        } else {
            parse_duration(&format!("1{per}"))?
        };
        if per.is_zero() {
            return Err(invalid("period must be positive"));
        }
        Ok(Self { count, per })
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.count, format_duration(self.per))
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Rate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse `"500ms"`, `"1.5s"`, `"2m"`, `"1h30m"`; a bare number means seconds
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let invalid = |reason: &str| SurgeError::InvalidOption {
        option: "duration".into(),
        reason: format!("`{input}`: {reason}"),
    };
    if s.is_empty() {
        return Err(invalid("empty"));
    }
    if let Ok(secs) = s.parse::<f64>() {
        if secs < 0.0 || !secs.is_finite() {
            return Err(invalid("must be non-negative"));
        }
        return Ok(Duration::from_secs_f64(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| invalid("missing unit"))?;
        let (num, tail) = rest.split_at(split);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let value: f64 = num.parse().map_err(|_| invalid("bad number"))?;
        let scale = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" | "sec" => 1.0,
            "m" | "min" => 60.0,
            "h" | "hr" => 3600.0,
            other => return Err(invalid(&format!("unknown unit `{other}`"))),
        };
        total += Duration::from_secs_f64(value * scale);
        rest = next;
    }
    Ok(total)
}

/// Render a duration the way [`parse_duration`] reads it back
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 && !d.is_zero() {
        format!("{}us", d.as_micros())
    } else if ms % 3_600_000 == 0 && ms > 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 && ms > 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

/// Serde adapter for durations written as strings
pub mod duration_str {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Secs(f64),
        }
        match Raw::deserialize(d)? {
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
            Raw::Secs(secs) if secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
            Raw::Secs(_) => Err(serde::de::Error::custom("negative duration")),
        }
    }
}

/// Global knobs of a workflow
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOptions {
    /// Virtual users (concurrent actors)
    #[serde(default = "default_vus")]
    pub vus: u32,

    /// Worker threads, each with its own reactor and pools
    #[serde(default = "default_threads")]
    pub threads: u16,

    /// Total run duration
    #[serde(default = "default_duration", with = "duration_str")]
    pub duration: Duration,

    #[serde(default)]
    pub persona: PersonaKind,

    /// Tokens per batch; defaults to the VU count when zero
    #[serde(default)]
    pub batch_size: usize,

    /// Pause between batches
    #[serde(default = "default_batch_interval", with = "duration_str")]
    pub batch_interval: Duration,

    /// Arrival rate for open-loop personas
    #[serde(default)]
    pub rate: Option<Rate>,

    /// Batch growth per interval (`ramped`)
    #[serde(default = "default_batch_gradient")]
    pub batch_gradient: usize,

    /// Batch size cap (`ramped`); defaults to the VU count when zero
    #[serde(default)]
    pub batch_max: usize,

    /// Interval shrink factor per batch (`ramped-interval`)
    #[serde(default = "default_interval_factor")]
    pub interval_factor: f64,

    /// Interval floor (`ramped-interval`)
    #[serde(default = "default_interval_min", with = "duration_str")]
    pub interval_min: Duration,

    /// How long in-flight work may finish after the duration elapses
    #[serde(default = "default_drain_grace", with = "duration_str")]
    pub drain_grace: Duration,
}

fn default_vus() -> u32 {
    1
}

fn default_threads() -> u16 {
    1
}

fn default_duration() -> Duration {
    Duration::from_secs(10)
}

fn default_batch_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_batch_gradient() -> usize {
    1
}

fn default_interval_factor() -> f64 {
    0.9
}

fn default_interval_min() -> Duration {
    Duration::from_millis(10)
}

fn default_drain_grace() -> Duration {
    Duration::from_secs(5)
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            vus: default_vus(),
            threads: default_threads(),
            duration: default_duration(),
            persona: PersonaKind::default(),
            batch_size: 0,
            batch_interval: default_batch_interval(),
            rate: None,
            batch_gradient: default_batch_gradient(),
            batch_max: 0,
            interval_factor: default_interval_factor(),
            interval_min: default_interval_min(),
            drain_grace: default_drain_grace(),
        }
    }
}

impl WorkflowOptions {
    /// Effective batch size
    pub fn batch(&self) -> usize {
        if self.batch_size == 0 {
            self.vus.max(1) as usize
        } else {
            self.batch_size
        }
    }

    /// Effective batch cap for ramping
    pub fn batch_cap(&self) -> usize {
        if self.batch_max == 0 {
            self.vus.max(1) as usize
        } else {
            self.batch_max
        }
    }

    /// Apply one `key=value` override
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let int = |v: &str| {
            v.trim().parse::<u64>().map_err(|_| SurgeError::InvalidOption {
                option: key.to_string(),
                reason: format!("`{v}` is not an integer"),
            })
        };
        match key {
            "vus" => self.vus = int(value)? as u32,
            "threads" => self.threads = int(value)?.max(1) as u16,
            "duration" => self.duration = parse_duration(value)?,
            "persona" => self.persona = value.parse()?,
            "batch_size" => self.batch_size = int(value)? as usize,
            "batch_interval" => self.batch_interval = parse_duration(value)?,
            "rate" => self.rate = Some(value.parse()?),
            "batch_gradient" => self.batch_gradient = int(value)? as usize,
            "batch_max" => self.batch_max = int(value)? as usize,
            "interval_min" => self.interval_min = parse_duration(value)?,
            "drain_grace" => self.drain_grace = parse_duration(value)?,
            "interval_factor" => {
                self.interval_factor =
                    value.trim().parse().map_err(|_| SurgeError::InvalidOption {
                        option: key.to_string(),
                        reason: format!("`{value}` is not a number"),
                    })?
            }
            other => {
                return Err(SurgeError::InvalidOption {
                    option: other.to_string(),
                    reason: "unrecognized option".into(),
                })
            }
        }
        Ok(())
    }

    /// Reject combinations no persona can run with
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(SurgeError::InvalidOption {
                option: "threads".into(),
                reason: "must be at least 1".into(),
            });
        }
        if !(self.interval_factor > 0.0 && self.interval_factor <= 1.0) {
            return Err(SurgeError::InvalidOption {
                option: "interval_factor".into(),
                reason: "must be in (0, 1]".into(),
            });
        }
        Ok(())
    }
}
