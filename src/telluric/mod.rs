//! # Telluric model
//!
//! Finds the wavelength regions absorbed by Earth's atmosphere for one sub-instrument partition.
//!
//! ## Procedure
//! -----------------
//! 1. Select the valid observation taken in the **most humid** conditions: it shows the deepest
//!    water-vapour lines. When no observation carries humidity metadata, the first valid
//!    observation of the partition is used instead; this fallback is logged and reported in the
//!    [`TelluricSummary`] so that it can be audited.
//! 2. Fetch the atmospheric state closest in time to that observation
//!    ([`archive::AtmosphericArchive`]).
//! 3. Run the [`TransmittanceSimulator`] over the observation's usable wavelength range.
//! 4. Flag every sample with `1 − T(λ) > X / 100` and coalesce contiguous flagged samples into
//!    closed wavelength intervals.
//!
//! The intervals are handed to the [`MaskBuilder`](crate::mask::MaskBuilder), which widens them
//! by the BERV amplitude.
//!
//! ## Errors
//! -----------------
//! * no atmospheric state → [`SpecStackError::DataUnavailable`],
//! * simulator failure or empty curve → [`SpecStackError::ExternalTool`].
pub mod archive;

use std::sync::Arc;

use itertools::Itertools;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::TelluricConfig;
use crate::constants::{Angstrom, FrameId};
use crate::dataset::Dataset;
use crate::frame::FrameDescriptor;
use crate::mask::intervals::WavelengthInterval;
use crate::partition::SubInstrumentPartition;
use crate::specstack_errors::SpecStackError;
use crate::telluric::archive::{AtmosphericArchive, AtmosphericState};

/// Simulated atmospheric transmittance, sampled on increasing wavelengths.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmittanceCurve {
    wavelengths: Vec<Angstrom>,
    transmittance: Vec<f64>,
}

impl TransmittanceCurve {
    /// Return
    /// ----------
    /// * [`SpecStackError::ExternalTool`] if the two vectors differ in length or the wavelengths
    ///   are not strictly increasing.
    pub fn new(wavelengths: Vec<Angstrom>, transmittance: Vec<f64>) -> Result<Self, SpecStackError> {
        if wavelengths.len() != transmittance.len() {
            return Err(SpecStackError::ExternalTool(format!(
                "transmittance curve has {} wavelengths and {} values",
                wavelengths.len(),
                transmittance.len()
            )));
        }
        if wavelengths.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SpecStackError::ExternalTool(
                "transmittance curve wavelengths are not strictly increasing".into(),
            ));
        }
        Ok(TransmittanceCurve {
            wavelengths,
            transmittance,
        })
    }

    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }

    /// Closed intervals where the absorption `1 − T` exceeds `threshold_percent / 100`.
    pub fn absorbed_intervals(
        &self,
        threshold_percent: f64,
    ) -> Result<Vec<WavelengthInterval>, SpecStackError> {
        let depth = threshold_percent / 100.0;
        let mut intervals = Vec::new();
        let runs = self
            .wavelengths
            .iter()
            .zip(&self.transmittance)
            .chunk_by(|(_, t)| 1.0 - **t > depth);
        for (flagged, run) in &runs {
            if !flagged {
                continue;
            }
            let waves: Vec<Angstrom> = run.map(|(w, _)| *w).collect();
            if let (Some(first), Some(last)) = (waves.first(), waves.last()) {
                intervals.push(WavelengthInterval::new(*first, *last)?);
            }
        }
        Ok(intervals)
    }
}

/// External atmospheric transmittance simulator.
pub trait TransmittanceSimulator: Send + Sync {
    fn simulate(
        &self,
        range: WavelengthInterval,
        state: &AtmosphericState,
    ) -> Result<TransmittanceCurve, SpecStackError>;

    /// Identity of the simulator and its settings, folded into the configuration fingerprint.
    fn identity(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// How the observation feeding the simulator was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    HighestHumidity,
    /// No valid observation had humidity metadata; the first one was used.
    FirstFrameFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelluricSummary {
    pub selected_frame: FrameId,
    pub selection: SelectionRule,
    pub state: AtmosphericState,
    pub intervals: Vec<WavelengthInterval>,
}

/// Pick the observation to simulate.
///
/// Ties on humidity keep the earliest observation in partition order.
pub fn select_observation(
    partition: &SubInstrumentPartition,
) -> Option<(&FrameDescriptor, SelectionRule)> {
    let mut best: Option<(&FrameDescriptor, f64)> = None;
    for descriptor in partition.valid_frames() {
        if let Some(h) = descriptor.humidity.filter(|h| h.is_finite()) {
            if best.map_or(true, |(_, current)| h > current) {
                best = Some((descriptor, h));
            }
        }
    }
    match best {
        Some((descriptor, _)) => Some((descriptor, SelectionRule::HighestHumidity)),
        None => partition
            .valid_frames()
            .next()
            .map(|d| (d, SelectionRule::FirstFrameFallback)),
    }
}

pub struct TelluricModel {
    config: TelluricConfig,
    archive: Arc<dyn AtmosphericArchive>,
    simulator: Arc<dyn TransmittanceSimulator>,
}

impl TelluricModel {
    pub fn new(
        config: &TelluricConfig,
        archive: Arc<dyn AtmosphericArchive>,
        simulator: Arc<dyn TransmittanceSimulator>,
    ) -> Self {
        TelluricModel {
            config: config.clone(),
            archive,
            simulator,
        }
    }

    /// Identities of the archive and the simulator.
    pub fn identity(&self) -> String {
        format!("{}|{}", self.archive.identity(), self.simulator.identity())
    }

    /// Compute the telluric intervals of a partition.
    ///
    /// Return
    /// ----------
    /// * The summary with the selected observation and the absorbed intervals.
    /// * [`SpecStackError::InsufficientData`] when the partition has no valid observation.
    pub fn compute(
        &self,
        partition: &SubInstrumentPartition,
        dataset: &Dataset,
    ) -> Result<TelluricSummary, SpecStackError> {
        let key = partition.key();
        let (descriptor, selection) =
            select_observation(partition).ok_or_else(|| SpecStackError::InsufficientData {
                sub_instrument: partition.sub_instrument().clone(),
                valid: 0,
                required: 1,
            })?;
        if selection == SelectionRule::FirstFrameFallback {
            warn!(
                "{key}: no humidity metadata, telluric model falls back to the first observation {}",
                descriptor.source_path
            );
        }

        let (lo, hi) = partition
            .load_frame(dataset, descriptor.id)?
            .valid_wavelength_range()
            .ok_or_else(|| {
                SpecStackError::DataUnavailable(format!(
                    "{} has no usable pixel to simulate",
                    descriptor.source_path
                ))
            })?;
        let range = WavelengthInterval::new(lo, hi)?;

        let state = self.archive.closest_state(descriptor.epoch)?;
        let curve = self
            .simulator
            .simulate(range, &state)
            .map_err(|err| match err {
                SpecStackError::ExternalTool(_) => err,
                other => SpecStackError::ExternalTool(other.to_string()),
            })?;
        if curve.is_empty() {
            return Err(SpecStackError::ExternalTool(format!(
                "{key}: transmittance simulator returned an empty curve"
            )));
        }

        let intervals = curve.absorbed_intervals(self.config.threshold_percent)?;
        info!(
            "{key}: {} telluric intervals from {} ({:?})",
            intervals.len(),
            descriptor.source_path,
            selection
        );
        Ok(TelluricSummary {
            selected_frame: descriptor.id,
            selection,
            state,
            intervals,
        })
    }
}
