//! # Uncertainty-propagating resampling
//!
//! Moves the flux of one observation onto the template wavelength grid. Resampling is always done
//! **inside one contiguous block of valid pixels** ([`valid_blocks`]): a masked pixel never feeds
//! an interpolated value, and a template pixel outside every block receives no contribution from
//! that observation.
//!
//! Every resampled value carries a variance:
//!
//! * [`InterpolationMode::Linear`] – weights `(1 − t, t)`, variance `Σ wᵢ² σᵢ²` plus the square of
//!   the next Newton term `f[x₀, x₁, x₂] (x − x₀)(x − x₁)` as truncation-error estimate,
//! * [`InterpolationMode::Cubic`] – 4-point Lagrange interpolation, variance `Σ wᵢ² σᵢ²` plus the
//!   square of the next Newton term (4th divided difference times the node polynomial) whenever a
//!   fifth node exists,
//! * [`InterpolationMode::GaussianProcess`] – local squared-exponential GP regression with
//!   per-pixel noise `σᵢ²`; the predictive variance is the propagated uncertainty.
//!
//! Blocks too short for the requested mode fall back to the richest scheme they support.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use log::debug;
use nalgebra::{DMatrix, DVector};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::specstack_errors::SpecStackError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterpolationMode {
    Linear,
    Cubic,
    GaussianProcess {
        /// Kernel length scale, in units of the local pixel spacing.
        length_scale_pixels: f64,
        /// Number of neighbouring pixels conditioning each prediction.
        window: usize,
    },
}

impl Default for InterpolationMode {
    fn default() -> Self {
        InterpolationMode::Cubic
    }
}

impl InterpolationMode {
    pub fn gaussian_process() -> Self {
        InterpolationMode::GaussianProcess {
            length_scale_pixels: 2.0,
            window: 8,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), SpecStackError> {
        if let InterpolationMode::GaussianProcess {
            length_scale_pixels,
            window,
        } = *self
        {
            if !(length_scale_pixels.is_finite() && length_scale_pixels > 0.0) {
                return Err(SpecStackError::InvalidParameter(format!(
                    "GP length scale must be > 0, got {length_scale_pixels}"
                )));
            }
            if window < 2 {
                return Err(SpecStackError::InvalidParameter(format!(
                    "GP window must hold at least 2 pixels, got {window}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for InterpolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpolationMode::Linear => write!(f, "linear"),
            InterpolationMode::Cubic => write!(f, "cubic"),
            InterpolationMode::GaussianProcess {
                length_scale_pixels,
                window,
            } => write!(f, "gp(l={length_scale_pixels}, n={window})"),
        }
    }
}

impl FromStr for InterpolationMode {
    type Err = SpecStackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(InterpolationMode::Linear),
            "cubic" | "spline" => Ok(InterpolationMode::Cubic),
            "gp" | "gaussian_process" => Ok(InterpolationMode::gaussian_process()),
            other => Err(SpecStackError::InvalidParameter(format!(
                "unknown interpolation mode '{other}'"
            ))),
        }
    }
}

/// Resampled value and its variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub variance: f64,
}

/// Contiguous runs of usable pixels.
///
/// A run ends at a masked pixel and also wherever the wavelength does not strictly increase.
pub fn valid_blocks(mask: ArrayView1<'_, bool>, wavelengths: ArrayView1<'_, f64>) -> Vec<Range<usize>> {
    let mut blocks = Vec::new();
    let mut start: Option<usize> = None;
    for i in 0..mask.len() {
        let usable = !mask[i] && wavelengths[i].is_finite();
        let continues = match start {
            Some(_) => usable && wavelengths[i] > wavelengths[i - 1],
            None => false,
        };
        match (start, usable, continues) {
            (Some(_), _, true) => {}
            (Some(s), true, false) => {
                blocks.push(s..i);
                start = Some(i);
            }
            (Some(s), false, _) => {
                blocks.push(s..i);
                start = None;
            }
            (None, true, _) => start = Some(i),
            (None, false, _) => {}
        }
    }
    if let Some(s) = start {
        blocks.push(s..mask.len());
    }
    blocks
}

/// Newton divided difference `f[x₀, …, xₙ]`.
fn divided_difference(x: &[f64], y: &[f64]) -> f64 {
    let mut table = y.to_vec();
    for level in 1..x.len() {
        for i in 0..x.len() - level {
            table[i] = (table[i + 1] - table[i]) / (x[i + level] - x[i]);
        }
    }
    table[0]
}

/// Index `i` such that `x[i] <= t <= x[i + 1]`, clamped to the valid range.
fn bracket(x: &[f64], t: f64) -> usize {
    let upper = x.partition_point(|v| *v <= t);
    upper.saturating_sub(1).min(x.len().saturating_sub(2))
}

fn linear(x: &[f64], y: &[f64], sigma: &[f64], t: f64) -> Sample {
    let i = bracket(x, t);
    let h = x[i + 1] - x[i];
    let u = (t - x[i]) / h;
    let (w0, w1) = (1.0 - u, u);
    let mut variance = w0 * w0 * sigma[i] * sigma[i] + w1 * w1 * sigma[i + 1] * sigma[i + 1];

    let third = if i + 2 < x.len() {
        Some(i + 2)
    } else {
        i.checked_sub(1)
    };
    if let Some(k) = third {
        let dd = divided_difference(&[x[i], x[i + 1], x[k]], &[y[i], y[i + 1], y[k]]);
        let truncation = dd * (t - x[i]) * (t - x[i + 1]);
        variance += truncation * truncation;
    }

    Sample {
        value: w0 * y[i] + w1 * y[i + 1],
        variance,
    }
}

fn cubic(x: &[f64], y: &[f64], sigma: &[f64], t: f64) -> Sample {
    let n = x.len();
    if n < 4 {
        return linear(x, y, sigma, t);
    }
    let i = bracket(x, t);
    let start = i.saturating_sub(1).min(n - 4);
    let nodes = start..start + 4;

    let mut value = 0.0;
    let mut variance = 0.0;
    for j in nodes.clone() {
        let mut w = 1.0;
        for m in nodes.clone() {
            if m != j {
                w *= (t - x[m]) / (x[j] - x[m]);
            }
        }
        value += w * y[j];
        variance += w * w * sigma[j] * sigma[j];
    }

    let fifth = if start + 4 < n {
        Some(start + 4)
    } else {
        start.checked_sub(1)
    };
    if let Some(k) = fifth {
        let mut xs: Vec<f64> = x[nodes.clone()].to_vec();
        let mut ys: Vec<f64> = y[nodes.clone()].to_vec();
        xs.push(x[k]);
        ys.push(y[k]);
        let node_poly: f64 = nodes.map(|m| t - x[m]).product();
        let truncation = divided_difference(&xs, &ys) * node_poly;
        variance += truncation * truncation;
    }

    Sample { value, variance }
}

fn gaussian_process(
    x: &[f64],
    y: &[f64],
    sigma: &[f64],
    t: f64,
    length_scale_pixels: f64,
    window: usize,
) -> Sample {
    let n = x.len();
    let size = window.min(n);
    let i = bracket(x, t);
    let lo = (i + 1).saturating_sub(size / 2).min(n - size);
    let xs = &x[lo..lo + size];
    let ys = &y[lo..lo + size];
    let ss = &sigma[lo..lo + size];

    let spacing = (xs[size - 1] - xs[0]) / (size - 1) as f64;
    let ell = length_scale_pixels * spacing;
    let mean = ys.iter().sum::<f64>() / size as f64;
    let noise_mean = ss.iter().map(|s| s * s).sum::<f64>() / size as f64;
    let spread = ys.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / size as f64;
    let amplitude = spread.max(noise_mean);

    let kernel = |a: f64, b: f64| amplitude * (-(a - b).powi(2) / (2.0 * ell * ell)).exp();
    let mut k = DMatrix::from_fn(size, size, |r, c| kernel(xs[r], xs[c]));
    for (d, s) in ss.iter().enumerate() {
        k[(d, d)] += s * s;
    }
    let k_star = DVector::from_fn(size, |r, _| kernel(xs[r], t));
    let residual = DVector::from_fn(size, |r, _| ys[r] - mean);

    let chol = match k.clone().cholesky() {
        Some(chol) => chol,
        None => {
            for d in 0..size {
                k[(d, d)] += 1e-10 * amplitude;
            }
            match k.cholesky() {
                Some(chol) => chol,
                None => {
                    debug!("GP covariance is not positive definite at {t}, using linear");
                    return linear(x, y, sigma, t);
                }
            }
        }
    };

    let alpha = chol.solve(&residual);
    let v = chol.solve(&k_star);
    Sample {
        value: mean + k_star.dot(&alpha),
        variance: (amplitude - k_star.dot(&v)).max(0.0),
    }
}

/// Resample one block of valid pixels at `targets`.
///
/// Arguments
/// -----------------
/// * `mode`: interpolation scheme
/// * `x`: strictly increasing wavelengths of the block
/// * `y`, `sigma`: flux and 1-σ uncertainty at `x`
/// * `targets`: wavelengths inside `[x₀, xₙ]`
///
/// Return
/// ----------
/// * One [`Sample`] per target, or [`SpecStackError::ShapeMismatch`] if the inputs disagree in
///   length, or [`SpecStackError::InvalidParameter`] if a target lies outside the block.
pub fn resample(
    mode: InterpolationMode,
    x: &[f64],
    y: &[f64],
    sigma: &[f64],
    targets: &[f64],
) -> Result<Vec<Sample>, SpecStackError> {
    if x.len() != y.len() || x.len() != sigma.len() {
        return Err(SpecStackError::ShapeMismatch(format!(
            "{} wavelengths, {} fluxes, {} uncertainties",
            x.len(),
            y.len(),
            sigma.len()
        )));
    }
    let (Some(first), Some(last)) = (x.first(), x.last()) else {
        return Ok(Vec::new());
    };
    if let Some(t) = targets.iter().find(|t| **t < *first || **t > *last) {
        return Err(SpecStackError::InvalidParameter(format!(
            "target {t} outside the block [{first}, {last}]"
        )));
    }

    if x.len() == 1 {
        return Ok(targets
            .iter()
            .map(|_| Sample {
                value: y[0],
                variance: sigma[0] * sigma[0],
            })
            .collect());
    }

    Ok(targets
        .iter()
        .map(|t| match mode {
            InterpolationMode::Linear => linear(x, y, sigma, *t),
            InterpolationMode::Cubic => cubic(x, y, sigma, *t),
            InterpolationMode::GaussianProcess {
                length_scale_pixels,
                window,
            } => gaussian_process(x, y, sigma, *t, length_scale_pixels, window),
        })
        .collect())
}
