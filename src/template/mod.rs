//! # Stellar template construction
//!
//! Stacks the valid observations of one sub-instrument partition into a high signal-to-noise
//! stellar spectrum, in the stellar rest frame.
//!
//! ## Procedure
//! -----------------
//! 1. Observations without a usable radial-velocity guess are rejected (see [`RvSource`]).
//! 2. A reference observation is chosen ([`ReferenceSelection`]); its wavelength grid, moved to the
//!    rest frame, becomes the template grid.
//! 3. Every observation is moved to the rest frame with its radial velocity ([`DopplerFormula`]) and
//!    resampled onto the template grid **inside its contiguous blocks of valid pixels only**
//!    ([`interpolation`]).
//! 4. Contributions are combined pixel by pixel ([`stacking`]) and the inclusion policy
//!    ([`InclusionPolicy`]) decides which template pixels stay unmasked.
//! 5. Pixels with a too low stacked flux, or where the template grid does not strictly increase,
//!    are masked; orders with too many masked pixels are reported as bad orders.
//!
//! Observations that cannot be loaded at run time, or whose shape differs from the reference, are
//! rejected with a recorded reason and do not count towards `min_frames`.
//!
//! ## Determinism
//! -----------------
//! Observations are visited in partition order and every reduction is accumulated in that order:
//! rebuilding a template from the same observations and configuration gives bit-identical arrays.
//!
//! ## See also
//! ------------
//! * [`crate::template_cache::TemplateStore`] – Persistence and reuse of templates.
//! * [`crate::config::TemplateConfig`] – Every parameter of this module.
pub mod interpolation;
pub mod stacking;

use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use log::{debug, info, warn};
use ndarray::{aview1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::config::TemplateConfig;
use crate::constants::{FrameId, KmPerSec, SubInstrumentId, VLIGHT};
use crate::dataset::Dataset;
use crate::frame::{Frame, FrameDescriptor};
use crate::partition::SubInstrumentPartition;
use crate::specstack_errors::SpecStackError;
use crate::template::interpolation::{resample, valid_blocks};
use crate::template::stacking::{combine, Contribution};

// -------------------------------------------------------------------------------------------------
// Options
// -------------------------------------------------------------------------------------------------

/// Conversion of observed wavelengths to the stellar rest frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DopplerFormula {
    /// `λ_rest = λ_obs / (1 + v/c)`
    #[default]
    Classical,
    /// `λ_rest = λ_obs · sqrt((1 − v/c) / (1 + v/c))`
    Relativistic,
}

impl DopplerFormula {
    pub fn to_rest(&self, observed: f64, rv: KmPerSec) -> f64 {
        let beta = rv / VLIGHT;
        match self {
            DopplerFormula::Classical => observed / (1.0 + beta),
            DopplerFormula::Relativistic => observed * ((1.0 - beta) / (1.0 + beta)).sqrt(),
        }
    }
}

/// Observation whose grid defines the template grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSelection {
    #[default]
    FirstValid,
    /// Observation with the smallest BERV.
    MinimumBerv,
}

/// Radial velocity used to move each observation to the rest frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RvSource {
    /// The observation's prior RV; observations without one are rejected.
    #[default]
    Prior,
    /// Zero for every observation.
    Zero,
}

/// Which template pixels stay unmasked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InclusionPolicy {
    /// At least one observation contributed.
    #[default]
    Union,
    /// Every used observation contributed.
    Intersection,
}

macro_rules! snake_case_enum_str {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($ty::$variant => write!(f, $name),)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = SpecStackError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
                    $($name => Ok($ty::$variant),)+
                    other => Err(SpecStackError::InvalidParameter(format!(
                        concat!("unknown ", stringify!($ty), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

snake_case_enum_str!(DopplerFormula { Classical => "classical", Relativistic => "relativistic" });
snake_case_enum_str!(ReferenceSelection { FirstValid => "first_valid", MinimumBerv => "minimum_berv" });
snake_case_enum_str!(RvSource { Prior => "prior", Zero => "zero" });
snake_case_enum_str!(InclusionPolicy { Union => "union", Intersection => "intersection" });

// -------------------------------------------------------------------------------------------------
// Output
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    MissingPriorRv,
    LoadFailed { message: String },
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::MissingPriorRv => write!(f, "no prior radial velocity"),
            RejectionReason::LoadFailed { message } => write!(f, "failed to load: {message}"),
            RejectionReason::ShapeMismatch { expected, found } => {
                write!(f, "shape {found:?} differs from the reference {expected:?}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedFrame {
    pub frame: FrameId,
    pub source_path: Utf8PathBuf,
    pub reason: RejectionReason,
}

/// How a template was obtained.
///
/// `rejection_fractions[i][o]` is the share of order `o` template pixels that `used_frames[i]`
/// did not contribute to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateProvenance {
    pub instrument: String,
    pub sub_instrument: SubInstrumentId,
    pub reference_frame: FrameId,
    pub used_frames: Vec<FrameId>,
    pub rejected_frames: Vec<RejectedFrame>,
    pub bad_orders: Vec<usize>,
    pub rejection_fractions: Vec<Vec<f64>>,
}

/// Stacked rest-frame spectrum of one sub-instrument, shaped `(orders, pixels)`.
///
/// Masked pixels (`mask == true`) keep their position; their flux and uncertainty must not be
/// used.
#[derive(Debug, Clone, PartialEq)]
pub struct StellarTemplate {
    pub wavelengths: Array2<f64>,
    pub flux: Array2<f64>,
    pub uncertainties: Array2<f64>,
    pub mask: Array2<bool>,
    pub provenance: TemplateProvenance,
}

impl StellarTemplate {
    pub fn shape(&self) -> (usize, usize) {
        self.wavelengths.dim()
    }

    pub fn n_valid_pixels(&self) -> usize {
        self.mask.iter().filter(|m| !**m).count()
    }

    pub fn is_order_usable(&self, order: usize) -> bool {
        order < self.shape().0 && !self.provenance.bad_orders.contains(&order)
    }

    /// `true` when every array matches `other` bit for bit.
    pub fn bit_identical(&self, other: &StellarTemplate) -> bool {
        let same = |a: &Array2<f64>, b: &Array2<f64>| {
            a.dim() == b.dim() && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
        };
        same(&self.wavelengths, &other.wavelengths)
            && same(&self.flux, &other.flux)
            && same(&self.uncertainties, &other.uncertainties)
            && self.mask == other.mask
    }
}

// -------------------------------------------------------------------------------------------------
// Builder
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TemplateBuilder {
    config: TemplateConfig,
}

impl TemplateBuilder {
    pub fn new(config: &TemplateConfig) -> Self {
        TemplateBuilder {
            config: config.clone(),
        }
    }

    fn rv_of(&self, descriptor: &FrameDescriptor) -> Option<KmPerSec> {
        match self.config.rv_source {
            RvSource::Prior => descriptor.prior_rv,
            RvSource::Zero => Some(0.0),
        }
    }

    fn ensure_enough(
        &self,
        partition: &SubInstrumentPartition,
        available: usize,
    ) -> Result<(), SpecStackError> {
        if available < self.config.min_frames || available == 0 {
            return Err(SpecStackError::InsufficientData {
                sub_instrument: partition.sub_instrument().clone(),
                valid: available,
                required: self.config.min_frames,
            });
        }
        Ok(())
    }

    fn pick_reference(&self, candidates: &[(&FrameDescriptor, KmPerSec)]) -> Option<usize> {
        match self.config.reference {
            ReferenceSelection::FirstValid => (!candidates.is_empty()).then_some(0),
            ReferenceSelection::MinimumBerv => candidates
                .iter()
                .enumerate()
                .min_by(|a, b| a.1 .0.berv.total_cmp(&b.1 .0.berv))
                .map(|(i, _)| i),
        }
    }

    /// Resample one order of `frame` onto the template grid of that order.
    ///
    /// Return
    /// ----------
    /// * The number of template pixels the order contributed to.
    fn resample_order(
        &self,
        frame: &Frame,
        order: usize,
        rv: KmPerSec,
        targets: ArrayView1<'_, f64>,
        slots: &mut [Vec<Contribution>],
    ) -> Result<usize, SpecStackError> {
        let waves: Vec<f64> = frame
            .order_wavelengths(order)
            .iter()
            .map(|w| self.config.doppler.to_rest(*w, rv))
            .collect();
        let flux = frame.order_flux(order);
        let sigma = frame.order_uncertainties(order);

        let mut taken = vec![false; targets.len()];
        let mut covered = 0;
        for block in valid_blocks(frame.order_mask(order), aview1(&waves)) {
            let (lo, hi) = (waves[block.start], waves[block.end - 1]);
            let pixels: Vec<usize> = (0..targets.len())
                .filter(|p| !taken[*p] && targets[*p] >= lo && targets[*p] <= hi)
                .collect();
            if pixels.is_empty() {
                continue;
            }

            let y: Vec<f64> = block.clone().map(|i| flux[i]).collect();
            let s: Vec<f64> = block.clone().map(|i| sigma[i]).collect();
            let t: Vec<f64> = pixels.iter().map(|p| targets[*p]).collect();
            let samples = resample(self.config.interpolation, &waves[block], &y, &s, &t)?;

            for (p, sample) in pixels.iter().zip(samples) {
                slots[*p].push(Contribution {
                    flux: sample.value,
                    variance: sample.variance,
                });
                taken[*p] = true;
                covered += 1;
            }
        }
        Ok(covered)
    }

    /// Build the template of a partition whose mask (if any) is already attached.
    ///
    /// Arguments
    /// -----------------
    /// * `partition`: the sub-instrument partition; frames are loaded through it so that the
    ///   partition mask is merged
    /// * `dataset`: lazy frame access; at most two frames are held at any time
    ///
    /// Return
    /// ----------
    /// * The template, or [`SpecStackError::InsufficientData`] when fewer than `min_frames`
    ///   observations are usable (before or after run-time rejections).
    pub fn build(
        &self,
        partition: &SubInstrumentPartition,
        dataset: &Dataset,
    ) -> Result<StellarTemplate, SpecStackError> {
        let key = partition.key();
        let mut rejected: Vec<RejectedFrame> = Vec::new();

        if self.config.rv_source == RvSource::Zero {
            warn!("{key}: using a zero radial velocity guess for every observation");
        }

        let mut candidates: Vec<(&FrameDescriptor, KmPerSec)> = Vec::new();
        for descriptor in partition.valid_frames() {
            match self.rv_of(descriptor) {
                Some(rv) => candidates.push((descriptor, rv)),
                None => {
                    warn!(
                        "{key}: {} rejected from the template, no prior radial velocity",
                        descriptor.source_path
                    );
                    rejected.push(RejectedFrame {
                        frame: descriptor.id,
                        source_path: descriptor.source_path.clone(),
                        reason: RejectionReason::MissingPriorRv,
                    });
                }
            }
        }
        self.ensure_enough(partition, candidates.len())?;

        let (reference, grid) = loop {
            let idx = self.pick_reference(&candidates).ok_or_else(|| {
                SpecStackError::InsufficientData {
                    sub_instrument: partition.sub_instrument().clone(),
                    valid: 0,
                    required: self.config.min_frames,
                }
            })?;
            let (descriptor, rv) = candidates[idx];
            match partition.load_frame(dataset, descriptor.id) {
                Ok(frame) => {
                    let grid = frame
                        .arrays()
                        .wavelengths
                        .mapv(|w| self.config.doppler.to_rest(w, rv));
                    break (descriptor.id, grid);
                }
                Err(err) => {
                    warn!("{key}: run-time rejection of {}: {err}", descriptor.source_path);
                    rejected.push(RejectedFrame {
                        frame: descriptor.id,
                        source_path: descriptor.source_path.clone(),
                        reason: RejectionReason::LoadFailed {
                            message: err.to_string(),
                        },
                    });
                    candidates.remove(idx);
                    self.ensure_enough(partition, candidates.len())?;
                }
            }
        };
        let (n_orders, n_pixels) = grid.dim();
        if n_orders == 0 || n_pixels == 0 {
            return Err(SpecStackError::ShapeMismatch(format!(
                "{key}: reference observation has shape {:?}",
                grid.dim()
            )));
        }
        info!("{key}: template grid taken from observation {reference}");

        let mut contributions: Vec<Vec<Contribution>> = vec![Vec::new(); n_orders * n_pixels];
        let mut used_frames = Vec::new();
        let mut rejection_fractions = Vec::new();
        for (descriptor, rv) in &candidates {
            let frame = match partition.load_frame(dataset, descriptor.id) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("{key}: run-time rejection of {}: {err}", descriptor.source_path);
                    rejected.push(RejectedFrame {
                        frame: descriptor.id,
                        source_path: descriptor.source_path.clone(),
                        reason: RejectionReason::LoadFailed {
                            message: err.to_string(),
                        },
                    });
                    continue;
                }
            };
            if frame.shape() != grid.dim() {
                warn!(
                    "{key}: {} has shape {:?}, reference has {:?}",
                    descriptor.source_path,
                    frame.shape(),
                    grid.dim()
                );
                rejected.push(RejectedFrame {
                    frame: descriptor.id,
                    source_path: descriptor.source_path.clone(),
                    reason: RejectionReason::ShapeMismatch {
                        expected: grid.dim(),
                        found: frame.shape(),
                    },
                });
                continue;
            }

            let mut fractions = Vec::with_capacity(n_orders);
            for order in 0..n_orders {
                let covered = if frame.is_order_valid(order) {
                    let slots = &mut contributions[order * n_pixels..(order + 1) * n_pixels];
                    self.resample_order(&frame, order, *rv, grid.row(order), slots)?
                } else {
                    0
                };
                fractions.push((n_pixels - covered) as f64 / n_pixels as f64);
            }
            debug!("{key}: stacked {}", descriptor.source_path);
            used_frames.push(descriptor.id);
            rejection_fractions.push(fractions);
        }
        self.ensure_enough(partition, used_frames.len())?;

        let mut flux = Array2::<f64>::zeros((n_orders, n_pixels));
        let mut uncertainties = Array2::<f64>::zeros((n_orders, n_pixels));
        let mut mask = Array2::from_elem((n_orders, n_pixels), false);
        for order in 0..n_orders {
            for pixel in 0..n_pixels {
                let slot = &contributions[order * n_pixels + pixel];
                match combine(self.config.stacking, slot) {
                    Some(stacked) => {
                        flux[[order, pixel]] = stacked.flux;
                        uncertainties[[order, pixel]] = stacked.uncertainty;
                        mask[[order, pixel]] = match self.config.inclusion {
                            InclusionPolicy::Union => stacked.n_used == 0,
                            InclusionPolicy::Intersection => stacked.n_used < used_frames.len(),
                        };
                    }
                    None => mask[[order, pixel]] = true,
                }
            }
        }

        if let Some(threshold) = self.config.min_template_flux {
            ndarray::Zip::from(&mut mask)
                .and(&flux)
                .for_each(|m, f| *m |= *f < threshold);
        }
        for order in 0..n_orders {
            for pixel in 0..n_pixels {
                let here = grid[[order, pixel]];
                let increasing = pixel + 1 == n_pixels || grid[[order, pixel + 1]] > here;
                if !here.is_finite() || !increasing {
                    mask[[order, pixel]] = true;
                }
            }
        }

        let cutoff = n_pixels.saturating_sub(self.config.bad_order_margin);
        let bad_orders: Vec<usize> = (0..n_orders)
            .filter(|o| mask.row(*o).iter().filter(|m| **m).count() > cutoff)
            .collect();
        for order in &bad_orders {
            warn!("{key}: order {order} has more than {cutoff}/{n_pixels} pixels masked");
        }

        let template = StellarTemplate {
            wavelengths: grid,
            flux,
            uncertainties,
            mask,
            provenance: TemplateProvenance {
                instrument: key.instrument.clone(),
                sub_instrument: key.sub_instrument.clone(),
                reference_frame: reference,
                used_frames,
                rejected_frames: rejected,
                bad_orders,
                rejection_fractions,
            },
        };
        info!(
            "{key}: template built from {} observations ({} rejected), {} valid pixels",
            template.provenance.used_frames.len(),
            template.provenance.rejected_frames.len(),
            template.n_valid_pixels()
        );
        Ok(template)
    }
}
