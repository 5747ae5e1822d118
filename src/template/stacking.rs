//! Combination of the resampled contributions of several observations into one template pixel.
//!
//! Contributions are accumulated **in partition order**, so that floating-point sums are
//! reproducible from one run to the next.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::specstack_errors::SpecStackError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackingMode {
    /// `f = Σ wᵢ fᵢ / Σ wᵢ`, `wᵢ = 1/σᵢ²`, `σ = (Σ wᵢ)^(-1/2)`
    #[default]
    WeightedMean,
    /// Median flux, `σ = sqrt(Σ σᵢ²) / N`
    Median,
}

impl fmt::Display for StackingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackingMode::WeightedMean => write!(f, "weighted_mean"),
            StackingMode::Median => write!(f, "median"),
        }
    }
}

impl FromStr for StackingMode {
    type Err = SpecStackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weighted_mean" | "mean" => Ok(StackingMode::WeightedMean),
            "median" => Ok(StackingMode::Median),
            other => Err(SpecStackError::InvalidParameter(format!(
                "unknown stacking mode '{other}'"
            ))),
        }
    }
}

/// One observation's resampled flux at a template pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contribution {
    pub flux: f64,
    pub variance: f64,
}

impl Contribution {
    /// Finite flux and finite, strictly positive variance.
    pub fn is_usable(&self) -> bool {
        self.flux.is_finite() && self.variance.is_finite() && self.variance > 0.0
    }
}

/// Stacked flux and its 1-σ uncertainty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stacked {
    pub flux: f64,
    pub uncertainty: f64,
    pub n_used: usize,
}

/// Combine the contributions of one template pixel.
///
/// Unusable contributions (see [`Contribution::is_usable`]) are dropped first; `None` when
/// nothing is left.
pub fn combine(mode: StackingMode, contributions: &[Contribution]) -> Option<Stacked> {
    let usable: Vec<&Contribution> = contributions.iter().filter(|c| c.is_usable()).collect();
    if usable.is_empty() {
        return None;
    }
    let n = usable.len();

    match mode {
        StackingMode::WeightedMean => {
            let (sum_wf, sum_w) = usable.iter().fold((0.0, 0.0), |(wf, w), c| {
                let weight = 1.0 / c.variance;
                (wf + weight * c.flux, w + weight)
            });
            Some(Stacked {
                flux: sum_wf / sum_w,
                uncertainty: sum_w.powf(-0.5),
                n_used: n,
            })
        }
        StackingMode::Median => {
            let mut fluxes: Vec<f64> = usable.iter().map(|c| c.flux).collect();
            fluxes.sort_by(f64::total_cmp);
            let median = if n % 2 == 1 {
                fluxes[n / 2]
            } else {
                0.5 * (fluxes[n / 2 - 1] + fluxes[n / 2])
            };
            let sum_var: f64 = usable.iter().map(|c| c.variance).sum();
            Some(Stacked {
                flux: median,
                uncertainty: sum_var.sqrt() / n as f64,
                n_used: n,
            })
        }
    }
}
