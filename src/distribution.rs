use std::collections::BTreeMap;

use rand::Rng;
use rand_distr::{Beta, Distribution as _, LogNormal, Normal, Triangular, Uniform};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WargameError};

/// Standard deviation of the point distribution used when a variable is
/// pinned at its central value.
pub const PIN_STD: f64 = 1e-10;

const NO_KEYS: &[&str] = &[];
const MEAN_STD: &[&str] = &["mean", "std"];
const MIN_MAX: &[&str] = &["min", "max"];
const MIN_MODE_MAX: &[&str] = &["min", "mode", "max"];
const ALPHA_BETA: &[&str] = &["alpha", "beta"];
const SCALE_LOC: &[&str] = &["scale", "loc"];

/// Probability law for one uncertain scenario variable.
///
/// On the wire a distribution is a flat object tagged by `"type"`:
/// `{"type": "normal", "mean": 100.0, "std": 15.0}`. Deserialization runs the
/// same validation as the constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDistribution", into = "RawDistribution")]
pub enum Distribution {
    Normal { mean: f64, std: f64 },
    Uniform { min: f64, max: f64 },
    Triangular { min: f64, mode: f64, max: f64 },
    /// `loc + scale * Beta(alpha, beta)`
    Beta { alpha: f64, beta: f64, scale: f64, loc: f64 },
    /// `exp(Normal(mean, std))`
    Lognormal { mean: f64, std: f64 },
}

impl Distribution {
    pub fn normal(mean: f64, std: f64) -> Result<Self> {
        Self::checked(Distribution::Normal { mean, std })
    }

    pub fn uniform(min: f64, max: f64) -> Result<Self> {
        Self::checked(Distribution::Uniform { min, max })
    }

    pub fn triangular(min: f64, mode: f64, max: f64) -> Result<Self> {
        Self::checked(Distribution::Triangular { min, mode, max })
    }

    /// Standard Beta on [0, 1].
    pub fn beta(alpha: f64, beta: f64) -> Result<Self> {
        Self::beta_scaled(alpha, beta, 1.0, 0.0)
    }

    pub fn beta_scaled(alpha: f64, beta: f64, scale: f64, loc: f64) -> Result<Self> {
        Self::checked(Distribution::Beta {
            alpha,
            beta,
            scale,
            loc,
        })
    }

    pub fn lognormal(mean: f64, std: f64) -> Result<Self> {
        Self::checked(Distribution::Lognormal { mean, std })
    }

    fn checked(dist: Distribution) -> Result<Self> {
        dist.validate()?;
        Ok(dist)
    }

    /// Build from a type name and a flat parameter map, the form used by
    /// scenario files.
    pub fn from_params(kind: &str, params: &BTreeMap<String, f64>) -> Result<Self> {
        let kind = kind.trim().to_ascii_lowercase();
        let (allowed, optional) = match kind.as_str() {
            "normal" | "lognormal" => (MEAN_STD, NO_KEYS),
            "uniform" => (MIN_MAX, NO_KEYS),
            "triangular" => (MIN_MODE_MAX, NO_KEYS),
            "beta" => (ALPHA_BETA, SCALE_LOC),
            other => {
                return Err(WargameError::validation(format!(
                    "unknown distribution type '{}'",
                    other
                )))
            }
        };

        if let Some(extra) = params
            .keys()
            .find(|k| !allowed.contains(&k.as_str()) && !optional.contains(&k.as_str()))
        {
            return Err(WargameError::validation(format!(
                "unexpected parameter '{}' for {} distribution",
                extra, kind
            )));
        }

        let get = |key: &str| -> Result<f64> {
            params.get(key).copied().ok_or_else(|| {
                WargameError::validation(format!(
                    "{} distribution is missing required parameter '{}'",
                    kind, key
                ))
            })
        };

        match kind.as_str() {
            "normal" => Self::normal(get("mean")?, get("std")?),
            "lognormal" => Self::lognormal(get("mean")?, get("std")?),
            "uniform" => Self::uniform(get("min")?, get("max")?),
            "triangular" => Self::triangular(get("min")?, get("mode")?, get("max")?),
            _ => Self::beta_scaled(
                get("alpha")?,
                get("beta")?,
                params.get("scale").copied().unwrap_or(1.0),
                params.get("loc").copied().unwrap_or(0.0),
            ),
        }
    }

    /// Check the ordering and positivity constraints of each law.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(WargameError::validation(msg));

        let params = self.params();
        if let Some((name, v)) = params.iter().find(|(_, v)| !v.is_finite()) {
            return fail(format!(
                "{} parameter '{}' must be finite, got {}",
                self.kind_name(),
                name,
                v
            ));
        }

        match *self {
            Distribution::Normal { std, .. } | Distribution::Lognormal { std, .. } => {
                if std <= 0.0 {
                    return fail(format!("{} std must be > 0, got {}", self.kind_name(), std));
                }
            }
            Distribution::Uniform { min, max } => {
                if min >= max {
                    return fail(format!("uniform requires min < max, got [{}, {}]", min, max));
                }
                if !(max - min).is_finite() {
                    return fail(format!("uniform range [{}, {}] overflows", min, max));
                }
            }
            Distribution::Triangular { min, mode, max } => {
                if min >= max {
                    return fail(format!(
                        "triangular requires min < max, got [{}, {}]",
                        min, max
                    ));
                }
                if mode < min || mode > max {
                    return fail(format!(
                        "triangular mode {} outside [{}, {}]",
                        mode, min, max
                    ));
                }
                if !(max - min).is_finite() {
                    return fail(format!("triangular range [{}, {}] overflows", min, max));
                }
            }
            Distribution::Beta {
                alpha, beta, scale, ..
            } => {
                if alpha <= 0.0 || beta <= 0.0 {
                    return fail(format!(
                        "beta requires alpha > 0 and beta > 0, got alpha={}, beta={}",
                        alpha, beta
                    ));
                }
                if scale <= 0.0 {
                    return fail(format!("beta scale must be > 0, got {}", scale));
                }
            }
        }
        Ok(())
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Distribution::Normal { .. } => "normal",
            Distribution::Uniform { .. } => "uniform",
            Distribution::Triangular { .. } => "triangular",
            Distribution::Beta { .. } => "beta",
            Distribution::Lognormal { .. } => "lognormal",
        }
    }

    /// Parameters as (name, value) pairs in declaration order.
    pub fn params(&self) -> Vec<(&'static str, f64)> {
        match *self {
            Distribution::Normal { mean, std } | Distribution::Lognormal { mean, std } => {
                vec![("mean", mean), ("std", std)]
            }
            Distribution::Uniform { min, max } => vec![("min", min), ("max", max)],
            Distribution::Triangular { min, mode, max } => {
                vec![("min", min), ("mode", mode), ("max", max)]
            }
            Distribution::Beta {
                alpha,
                beta,
                scale,
                loc,
            } => vec![
                ("alpha", alpha),
                ("beta", beta),
                ("scale", scale),
                ("loc", loc),
            ],
        }
    }

    /// Closed-form expected value.
    pub fn mean(&self) -> f64 {
        match *self {
            Distribution::Normal { mean, .. } => mean,
            Distribution::Uniform { min, max } => 0.5 * (min + max),
            Distribution::Triangular { min, mode, max } => (min + mode + max) / 3.0,
            Distribution::Beta {
                alpha,
                beta,
                scale,
                loc,
            } => loc + scale * alpha / (alpha + beta),
            Distribution::Lognormal { mean, std } => (mean + 0.5 * std * std).exp(),
        }
    }

    /// Closed-form standard deviation.
    pub fn std_dev(&self) -> f64 {
        match *self {
            Distribution::Normal { std, .. } => std,
            Distribution::Uniform { min, max } => (max - min) / 12f64.sqrt(),
            Distribution::Triangular { min, mode, max } => {
                ((min * min + mode * mode + max * max - min * mode - min * max - mode * max)
                    / 18.0)
                    .sqrt()
            }
            Distribution::Beta {
                alpha, beta, scale, ..
            } => {
                let s = alpha + beta;
                scale * (alpha * beta / (s * s * (s + 1.0))).sqrt()
            }
            Distribution::Lognormal { mean, std } => {
                let v = std * std;
                ((v.exp() - 1.0) * (2.0 * mean + v).exp()).sqrt()
            }
        }
    }

    /// Value a variable is pinned at during one-at-a-time sensitivity runs:
    /// mean for normal and lognormal, midpoint for uniform, mode for
    /// triangular, `loc + scale * alpha / (alpha + beta)` for beta.
    pub fn central_value(&self) -> f64 {
        match *self {
            Distribution::Triangular { mode, .. } => mode,
            _ => self.mean(),
        }
    }

    /// Near-deterministic replacement pinned at `central_value()`.
    pub fn pinned(&self) -> Distribution {
        Distribution::Normal {
            mean: self.central_value(),
            std: PIN_STD,
        }
    }

    /// Antithetic counterpart of a draw. Only normal and uniform laws have a
    /// reflection; the other kinds return `None`.
    pub fn reflect(&self, x: f64) -> Option<f64> {
        match *self {
            Distribution::Normal { mean, .. } => Some(2.0 * mean - x),
            Distribution::Uniform { min, max } => Some(min + max - x),
            _ => None,
        }
    }

    pub fn has_reflection(&self) -> bool {
        matches!(
            self,
            Distribution::Normal { .. } | Distribution::Uniform { .. }
        )
    }

    /// Build the reusable sampler for this law.
    pub fn sampler(&self) -> Result<Sampler> {
        self.validate()?;
        let bad = |e: &dyn std::fmt::Display| {
            WargameError::validation(format!("{} sampler: {}", self.kind_name(), e))
        };
        let kind = match *self {
            Distribution::Normal { mean, std } => {
                SamplerKind::Normal(Normal::new(mean, std).map_err(|e| bad(&e))?)
            }
            Distribution::Uniform { min, max } => SamplerKind::Uniform(Uniform::new(min, max)),
            Distribution::Triangular { min, mode, max } => {
                SamplerKind::Triangular(Triangular::new(min, max, mode).map_err(|e| bad(&e))?)
            }
            Distribution::Beta {
                alpha,
                beta,
                scale,
                loc,
            } => SamplerKind::Beta {
                dist: Beta::new(alpha, beta).map_err(|e| bad(&e))?,
                scale,
                loc,
            },
            Distribution::Lognormal { mean, std } => {
                SamplerKind::Lognormal(LogNormal::new(mean, std).map_err(|e| bad(&e))?)
            }
        };
        Ok(Sampler { kind })
    }

    /// Parse one `"type"`-tagged JSON object. A malformed object is a
    /// `Config` error; bad parameters are a `Validation` error.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        let raw: RawDistribution = serde_json::from_value(value)?;
        Distribution::try_from(raw)
    }

    /// Draw `n` samples.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Vec<f64>> {
        Ok(self.sampler()?.sample_n(n, rng))
    }
}

#[derive(Debug, Clone)]
enum SamplerKind {
    Normal(Normal<f64>),
    Uniform(Uniform<f64>),
    Triangular(Triangular<f64>),
    Beta { dist: Beta<f64>, scale: f64, loc: f64 },
    Lognormal(LogNormal<f64>),
}

/// Validated, ready-to-draw form of a [`Distribution`].
#[derive(Debug, Clone)]
pub struct Sampler {
    kind: SamplerKind,
}

impl Sampler {
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match &self.kind {
            SamplerKind::Normal(d) => d.sample(rng),
            SamplerKind::Uniform(d) => d.sample(rng),
            SamplerKind::Triangular(d) => d.sample(rng),
            SamplerKind::Beta { dist, scale, loc } => loc + scale * dist.sample(rng),
            SamplerKind::Lognormal(d) => d.sample(rng),
        }
    }

    pub fn sample_n<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<f64> {
        (0..n).map(|_| self.draw(rng)).collect()
    }
}

/// Serde form: a `type` tag plus flat numeric parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDistribution {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    params: BTreeMap<String, f64>,
}

impl TryFrom<RawDistribution> for Distribution {
    type Error = WargameError;

    fn try_from(raw: RawDistribution) -> Result<Self> {
        Distribution::from_params(&raw.kind, &raw.params)
    }
}

impl From<Distribution> for RawDistribution {
    fn from(d: Distribution) -> Self {
        RawDistribution {
            kind: d.kind_name().to_string(),
            params: d
                .params()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}
