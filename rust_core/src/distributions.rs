use ndarray::Zip;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution as _, StandardNormal};

use crate::error::{McmcError, Result};
use crate::tensor::{self, Tensor};

/// Conditional distributions a probabilistic vertex can follow.
///
/// Parameters are the vertex's parents, in the order given by
/// [`Distribution::param_names`], and broadcast element-wise against the
/// vertex value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Uniform on `[lower, upper)`.
    Uniform,
    /// Normal with mean `mu` and standard deviation `sigma`.
    Gaussian,
    /// Values 0.0 / 1.0 with success probability `p`.
    Bernoulli,
    /// Exponential with rate `rate` on `[0, inf)`.
    Exponential,
}

/// Partial derivatives of a log-density with respect to the value and to each parameter.
#[derive(Debug, Clone)]
pub struct LogProbGradient {
    pub wrt_value: Tensor,
    /// Reduced to each parameter's own shape.
    pub wrt_params: Vec<Tensor>,
}

impl Distribution {
    pub fn param_names(&self) -> &'static [&'static str] {
        match self {
            Distribution::Uniform => &["lower", "upper"],
            Distribution::Gaussian => &["mu", "sigma"],
            Distribution::Bernoulli => &["p"],
            Distribution::Exponential => &["rate"],
        }
    }

    pub fn param_count(&self) -> usize {
        self.param_names().len()
    }

    /// Whether the support is continuous, i.e. random-walk proposals make sense.
    pub fn is_continuous(&self) -> bool {
        !matches!(self, Distribution::Bernoulli)
    }

    /// Joint log-density of every element of `value`.
    pub fn log_prob(&self, value: &Tensor, params: &[&Tensor]) -> Result<f64> {
        let p = expand_params(self, value.shape(), params)?;

        let total = match self {
            Distribution::Uniform => Zip::from(value)
                .and(&p[0])
                .and(&p[1])
                .fold(0.0, |acc, &x, &lo, &hi| acc + uniform_logp(x, lo, hi)),
            Distribution::Gaussian => Zip::from(value)
                .and(&p[0])
                .and(&p[1])
                .fold(0.0, |acc, &x, &mu, &sigma| acc + normal_logp(x, mu, sigma)),
            Distribution::Bernoulli => Zip::from(value)
                .and(&p[0])
                .fold(0.0, |acc, &x, &prob| acc + bernoulli_logp(x, prob)),
            Distribution::Exponential => Zip::from(value)
                .and(&p[0])
                .fold(0.0, |acc, &x, &rate| acc + exponential_logp(x, rate)),
        };

        Ok(total)
    }

    pub fn dlog_prob(&self, value: &Tensor, params: &[&Tensor]) -> Result<LogProbGradient> {
        let shape = value.shape();
        let p = expand_params(self, shape, params)?;

        let (wrt_value, wrt_expanded) = match self {
            Distribution::Uniform => {
                let inside = Zip::from(value)
                    .and(&p[0])
                    .and(&p[1])
                    .map_collect(|&x, &lo, &hi| if x >= lo && x < hi { 1.0 / (hi - lo) } else { 0.0 });
                (tensor::filled(shape, 0.0), vec![inside.clone(), -inside])
            }
            Distribution::Gaussian => {
                let dx = Zip::from(value)
                    .and(&p[0])
                    .and(&p[1])
                    .map_collect(|&x, &mu, &sigma| -(x - mu) / (sigma * sigma));
                let dsigma = Zip::from(value)
                    .and(&p[0])
                    .and(&p[1])
                    .map_collect(|&x, &mu, &sigma| {
                        let diff = x - mu;
                        diff * diff / (sigma * sigma * sigma) - 1.0 / sigma
                    });
                let dmu = -&dx;
                (dx, vec![dmu, dsigma])
            }
            Distribution::Bernoulli => {
                let dp = Zip::from(value)
                    .and(&p[0])
                    .map_collect(|&x, &prob| if x > 0.5 { 1.0 / prob } else { -1.0 / (1.0 - prob) });
                (tensor::filled(shape, 0.0), vec![dp])
            }
            Distribution::Exponential => {
                let dx = Zip::from(value)
                    .and(&p[0])
                    .map_collect(|&x, &rate| if x >= 0.0 { -rate } else { 0.0 });
                let drate = Zip::from(value)
                    .and(&p[0])
                    .map_collect(|&x, &rate| if x >= 0.0 { 1.0 / rate - x } else { 0.0 });
                (dx.into_dyn(), vec![drate.into_dyn()])
            }
        };

        let wrt_params = wrt_expanded
            .iter()
            .zip(params)
            .map(|(grad, param)| tensor::sum_to(grad, param.shape()))
            .collect();

        Ok(LogProbGradient {
            wrt_value: wrt_value.into_dyn(),
            wrt_params,
        })
    }

    /// Draw a value of `shape` given the current parameter values.
    pub fn sample(&self, shape: &[usize], params: &[&Tensor], rng: &mut ChaCha8Rng) -> Result<Tensor> {
        let p = expand_params(self, shape, params)?;

        let drawn = match self {
            Distribution::Uniform => Zip::from(&p[0])
                .and(&p[1])
                .map_collect(|&lo, &hi| lo + (hi - lo) * rng.gen::<f64>()),
            Distribution::Gaussian => Zip::from(&p[0]).and(&p[1]).map_collect(|&mu, &sigma| {
                let z: f64 = StandardNormal.sample(rng);
                mu + sigma * z
            }),
            Distribution::Bernoulli => p[0].mapv(|prob| if rng.gen::<f64>() < prob { 1.0 } else { 0.0 }),
            Distribution::Exponential => p[0].mapv(|rate| -(1.0 - rng.gen::<f64>()).ln() / rate),
        };

        Ok(drawn.into_dyn())
    }
}

fn expand_params(dist: &Distribution, shape: &[usize], params: &[&Tensor]) -> Result<Vec<Tensor>> {
    if params.len() != dist.param_count() {
        return Err(McmcError::InvalidVertex(format!(
            "{:?} takes {} parameter(s), got {}",
            dist,
            dist.param_count(),
            params.len()
        )));
    }
    params.iter().map(|p| tensor::broadcast_to(p, shape)).collect()
}

fn uniform_logp(x: f64, lower: f64, upper: f64) -> f64 {
    if x >= lower && x < upper {
        -(upper - lower).ln()
    } else {
        f64::NEG_INFINITY
    }
}

pub(crate) fn normal_logp(x: f64, mu: f64, sigma: f64) -> f64 {
    let diff = x - mu;
    -0.5 * (diff * diff) / (sigma * sigma) - sigma.ln() - 0.5 * std::f64::consts::TAU.ln()
}

fn bernoulli_logp(x: f64, p: f64) -> f64 {
    if x > 0.5 {
        p.ln()
    } else {
        (1.0 - p).ln()
    }
}

fn exponential_logp(x: f64, rate: f64) -> f64 {
    if x >= 0.0 {
        rate.ln() - rate * x
    } else {
        f64::NEG_INFINITY
    }
}
