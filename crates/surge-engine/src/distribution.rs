//! Load-curve distributions
//!
//! A [`Distribution`] is one struct carrying a sampler function and its
//! parameters. Adding a distribution means adding a constructor.
//!
//! | Name          | Parameters            | Typical use                    |
//! |---------------|-----------------------|--------------------------------|
//! | `constant`    | value                 | fixed pacing                   |
//! | `uniform`     | low, high             | jittered pauses                |
//! | `normal`      | mean, std_dev         | think time                     |
//! | `exponential` | mean                  | Poisson inter-arrival gaps     |
//! | `log-normal`  | mu, sigma             | heavy-tailed think time        |

use rand::RngCore;
use rand_distr::{Distribution as Sample, Exp, LogNormal, Normal, Uniform};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use surge_core::SurgeError;

type Sampler = fn(&[f64; 2], &mut dyn RngCore) -> f64;

/// Named sampler plus parameters
#[derive(Clone, Copy)]
pub struct Distribution {
    name: &'static str,
    params: [f64; 2],
    sampler: Sampler,
}

fn invalid(name: &str, reason: &str) -> SurgeError {
    SurgeError::InvalidOption {
        option: format!("distribution.{name}"),
        reason: reason.to_string(),
    }
}

fn finite(name: &str, values: &[f64]) -> Result<(), SurgeError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(invalid(name, "parameters must be finite"))
    }
}

impl Distribution {
    pub fn constant(value: f64) -> Result<Self, SurgeError> {
        finite("constant", &[value])?;
        Ok(Self {
            name: "constant",
            params: [value, 0.0],
            sampler: |p: &[f64; 2], _: &mut dyn RngCore| p[0],
        })
    }

    pub fn uniform(low: f64, high: f64) -> Result<Self, SurgeError> {
        finite("uniform", &[low, high])?;
        if low > high {
            return Err(invalid("uniform", "low must not exceed high"));
        }
        Ok(Self {
            name: "uniform",
            params: [low, high],
            sampler: |p: &[f64; 2], rng: &mut dyn RngCore| {
                Uniform::new_inclusive(p[0], p[1]).sample(rng)
            },
        })
    }

    pub fn normal(mean: f64, std_dev: f64) -> Result<Self, SurgeError> {
        finite("normal", &[mean, std_dev])?;
        if std_dev < 0.0 {
            return Err(invalid("normal", "std_dev must be non-negative"));
        }
        Ok(Self {
            name: "normal",
            params: [mean, std_dev],
            sampler: |p: &[f64; 2], rng: &mut dyn RngCore| {
                Normal::new(p[0], p[1]).map_or(p[0], |d| d.sample(rng))
            },
        })
    }

    /// Exponential with the given mean (rate `1 / mean`)
    pub fn exponential(mean: f64) -> Result<Self, SurgeError> {
        finite("exponential", &[mean])?;
        if mean <= 0.0 {
            return Err(invalid("exponential", "mean must be positive"));
        }
        Ok(Self {
            name: "exponential",
            params: [mean, 0.0],
            sampler: |p: &[f64; 2], rng: &mut dyn RngCore| {
                Exp::new(1.0 / p[0]).map_or(p[0], |d| d.sample(rng))
            },
        })
    }

    pub fn log_normal(mu: f64, sigma: f64) -> Result<Self, SurgeError> {
        finite("log-normal", &[mu, sigma])?;
        if sigma < 0.0 {
            return Err(invalid("log-normal", "sigma must be non-negative"));
        }
        Ok(Self {
            name: "log-normal",
            params: [mu, sigma],
            sampler: |p: &[f64; 2], rng: &mut dyn RngCore| {
                LogNormal::new(p[0], p[1]).map_or(p[0].exp(), |d| d.sample(rng))
            },
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn params(&self) -> [f64; 2] {
        self.params
    }

    pub fn sample(&self, rng: &mut dyn RngCore) -> f64 {
        (self.sampler)(&self.params, rng)
    }

    /// Sample interpreted as seconds; negative draws clamp to zero
    pub fn sample_duration(&self, rng: &mut dyn RngCore) -> Duration {
        let secs = self.sample(rng);
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }
}

impl fmt::Debug for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Distribution")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Serializable description of a [`Distribution`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DistributionSpec {
    Constant { value: f64 },
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, std_dev: f64 },
    Exponential { mean: f64 },
    LogNormal { mu: f64, sigma: f64 },
}

impl DistributionSpec {
    pub fn build(&self) -> Result<Distribution, SurgeError> {
        match *self {
            Self::Constant { value } => Distribution::constant(value),
            Self::Uniform { low, high } => Distribution::uniform(low, high),
            Self::Normal { mean, std_dev } => Distribution::normal(mean, std_dev),
            Self::Exponential { mean } => Distribution::exponential(mean),
            Self::LogNormal { mu, sigma } => Distribution::log_normal(mu, sigma),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_constant() {
        let d = Distribution::constant(0.25).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(d.sample(&mut rng), 0.25);
        assert_eq!(d.sample_duration(&mut rng), Duration::from_millis(250));
    }

    #[test]
    fn test_uniform_bounds() {
        let d = Distribution::uniform(1.0, 2.0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let v = d.sample(&mut rng);
            assert!((1.0..=2.0).contains(&v));
        }
        assert!(Distribution::uniform(2.0, 1.0).is_err());
    }

    #[test]
    fn test_exponential_mean() {
        let d = Distribution::exponential(0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let n = 20_000;
        let mean = (0..n).map(|_| d.sample(&mut rng)).sum::<f64>() / n as f64;
        assert!((mean - 0.5).abs() < 0.05, "mean {mean}");
        assert!(Distribution::exponential(0.0).is_err());
    }

    #[test]
    fn test_negative_draws_clamp() {
        let d = Distribution::normal(-5.0, 0.1).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(d.sample_duration(&mut rng), Duration::ZERO);
    }

    #[test]
    fn test_spec_from_json() {
        let spec: DistributionSpec =
            serde_json::from_str(r#"{"kind": "log-normal", "mu": 0.0, "sigma": 0.5}"#).unwrap();
        let d = spec.build().unwrap();
        assert_eq!(d.name(), "log-normal");
        assert_eq!(d.params(), [0.0, 0.5]);
        assert!(DistributionSpec::Normal {
            mean: 1.0,
            std_dev: f64::NAN
        }
        .build()
        .is_err());
    }
}
