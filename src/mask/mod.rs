//! # Pixel mask construction
//!
//! Builds the dataset-level exclusion mask of one sub-instrument partition. The mask is a boolean
//! `(orders, pixels)` array (`true` = exclude) assembled **additively**:
//!
//! 1. telluric intervals are widened by the yearly BERV amplitude ([`berv::BervSource`]),
//! 2. for every valid observation, the widened intervals are Doppler-shifted by that
//!    observation's BERV and the pixels they cover on its wavelength grid are flagged; the
//!    unshifted widened intervals are flagged as well,
//! 3. activity and user intervals are flagged on every observation's grid without widening.
//!
//! Flagging is a union, so the result does not depend on the order in which observations are
//! visited. Intervals that fall outside an order simply flag nothing.
//!
//! Once built, the mask is frozen into the partition with
//! [`SubInstrumentPartition::attach_mask`](crate::partition::SubInstrumentPartition::attach_mask).
//!
//! ## Example
//! -----------------
//! ```rust,ignore
//! let mut builder = MaskBuilder::new(&config.mask)?;
//! builder.register_telluric(&summary.intervals)?;
//! let mask = builder.build_and_attach(&partition, &dataset)?;
//! ```
pub mod berv;
pub mod intervals;

use std::sync::Arc;

use log::{debug, info};
use ndarray::{Array2, ArrayView1, Zip};

use crate::config::MaskConfig;
use crate::dataset::Dataset;
use crate::mask::berv::BervSource;
use crate::mask::intervals::{IntervalRegistry, RegionKind, WavelengthInterval};
use crate::partition::SubInstrumentPartition;
use crate::specstack_errors::SpecStackError;

/// Boolean exclusion mask shaped `(orders, pixels)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMask {
    flags: Array2<bool>,
}

impl PixelMask {
    pub fn empty(shape: (usize, usize)) -> Self {
        PixelMask {
            flags: Array2::from_elem(shape, false),
        }
    }

    pub fn from_flags(flags: Array2<bool>) -> Self {
        PixelMask { flags }
    }

    pub fn flags(&self) -> &Array2<bool> {
        &self.flags
    }

    pub fn shape(&self) -> (usize, usize) {
        self.flags.dim()
    }

    pub fn is_masked(&self, order: usize, pixel: usize) -> bool {
        self.flags.get((order, pixel)).copied().unwrap_or(false)
    }

    pub fn count_masked(&self) -> usize {
        self.flags.iter().filter(|m| **m).count()
    }

    /// Union another mask into this one.
    pub fn union_with(&mut self, other: &PixelMask) -> Result<(), SpecStackError> {
        if other.shape() != self.shape() {
            return Err(SpecStackError::ShapeMismatch(format!(
                "cannot merge mask {:?} into mask {:?}",
                other.shape(),
                self.shape()
            )));
        }
        Zip::from(&mut self.flags)
            .and(&other.flags)
            .for_each(|a, b| *a |= *b);
        Ok(())
    }

    /// Flag every pixel of `wavelengths` that falls inside `interval`.
    ///
    /// Return
    /// ----------
    /// * The number of pixels newly flagged.
    pub fn flag_interval(&mut self, wavelengths: &Array2<f64>, interval: &WavelengthInterval) -> usize {
        let mut flagged = 0;
        Zip::from(&mut self.flags)
            .and(wavelengths)
            .for_each(|m, w| {
                if !*m && interval.contains(*w) {
                    *m = true;
                    flagged += 1;
                }
            });
        flagged
    }

    /// `true` if every pixel of `wavelengths` lying in `interval` is flagged.
    pub fn covers(&self, wavelengths: &Array2<f64>, interval: &WavelengthInterval) -> bool {
        Zip::from(&self.flags)
            .and(wavelengths)
            .fold(true, |acc, m, w| acc && (*m || !interval.contains(*w)))
    }

    /// Flags of one order.
    pub fn order(&self, order: usize) -> ArrayView1<'_, bool> {
        self.flags.row(order)
    }
}

/// Name prefix of the intervals produced by the telluric model.
pub const TELLURIC_PREFIX: &str = "telluric_";

/// Assembles the mask of one partition from its registered intervals.
#[derive(Debug, Clone)]
pub struct MaskBuilder {
    berv_source: BervSource,
    registry: IntervalRegistry,
}

impl MaskBuilder {
    /// Start a builder with the activity lines (if enabled) and user intervals of `config`.
    ///
    /// Return
    /// ----------
    /// * [`SpecStackError::DuplicateInterval`] if a user interval reuses a registered name.
    pub fn new(config: &MaskConfig) -> Result<Self, SpecStackError> {
        let mut registry = if config.activity_lines {
            IntervalRegistry::with_activity_lines()?
        } else {
            IntervalRegistry::new()
        };
        for user in &config.user_intervals {
            registry.register(
                &user.name,
                RegionKind::User,
                WavelengthInterval::new(user.start, user.end)?,
            )?;
        }
        Ok(MaskBuilder {
            berv_source: config.berv_source,
            registry,
        })
    }

    /// Declare an additional named interval.
    pub fn register(
        &mut self,
        name: &str,
        kind: RegionKind,
        interval: WavelengthInterval,
    ) -> Result<(), SpecStackError> {
        self.registry.register(name, kind, interval)
    }

    /// Declare the intervals produced by the telluric model, named `telluric_<index>`.
    pub fn register_telluric(
        &mut self,
        intervals: &[WavelengthInterval],
    ) -> Result<(), SpecStackError> {
        for (i, interval) in intervals.iter().enumerate() {
            self.registry.register(
                &format!("{TELLURIC_PREFIX}{i}"),
                RegionKind::Telluric,
                *interval,
            )?;
        }
        Ok(())
    }

    pub fn registry(&self) -> &IntervalRegistry {
        &self.registry
    }

    /// Build the mask of a partition from its valid observations.
    ///
    /// Arguments
    /// -----------------
    /// * `partition`: the partition whose valid frames define the pixel grids
    /// * `dataset`: lazy access to the frame arrays; each frame is released after use
    ///
    /// Return
    /// ----------
    /// * The mask, shaped like the partition's frames.
    /// * [`SpecStackError::InsufficientData`] if the partition has no valid observation.
    /// * [`SpecStackError::ShapeMismatch`] if the valid observations do not share one shape.
    pub fn build(
        &self,
        partition: &SubInstrumentPartition,
        dataset: &Dataset,
    ) -> Result<PixelMask, SpecStackError> {
        let valid: Vec<_> = partition.valid_frames().collect();
        if valid.is_empty() {
            return Err(SpecStackError::InsufficientData {
                sub_instrument: partition.sub_instrument().clone(),
                valid: 0,
                required: 1,
            });
        }

        let v_max = self.berv_source.max_velocity(valid.iter().copied());
        let widened: Vec<WavelengthInterval> = self
            .registry
            .of_kind(RegionKind::Telluric)
            .map(|interval| interval.widened(v_max))
            .collect();
        let direct: Vec<WavelengthInterval> = self
            .registry
            .iter()
            .filter(|e| e.kind != RegionKind::Telluric)
            .map(|e| e.interval)
            .collect();
        debug!(
            "{}: widening {} telluric intervals by {v_max:.3} km/s, {} direct intervals",
            partition.key(),
            widened.len(),
            direct.len()
        );

        let mut mask: Option<PixelMask> = None;
        for descriptor in valid {
            let frame = dataset.load_frame(descriptor.id)?;
            let mask = mask.get_or_insert_with(|| PixelMask::empty(frame.shape()));
            if frame.shape() != mask.shape() {
                return Err(SpecStackError::ShapeMismatch(format!(
                    "{}: frame {} has shape {:?}, expected {:?}",
                    partition.key(),
                    descriptor.source_path,
                    frame.shape(),
                    mask.shape()
                )));
            }

            let wavelengths = &frame.arrays().wavelengths;
            for interval in &widened {
                mask.flag_interval(wavelengths, interval);
                mask.flag_interval(wavelengths, &interval.shifted(descriptor.berv));
            }
            for interval in &direct {
                mask.flag_interval(wavelengths, interval);
            }
        }

        let mask = mask.ok_or_else(|| {
            SpecStackError::InvalidParameter(format!("{}: no frame was visited", partition.key()))
        })?;
        info!(
            "{}: pixel mask built, {} of {} pixels excluded",
            partition.key(),
            mask.count_masked(),
            mask.flags().len()
        );
        Ok(mask)
    }

    /// [`MaskBuilder::build`] followed by freezing the mask into the partition.
    pub fn build_and_attach(
        &self,
        partition: &SubInstrumentPartition,
        dataset: &Dataset,
    ) -> Result<Arc<PixelMask>, SpecStackError> {
        let mask = self.build(partition, dataset)?;
        partition.attach_mask(mask)?;
        partition.mask().cloned().ok_or_else(|| {
            SpecStackError::InvalidParameter(format!("{}: mask was not attached", partition.key()))
        })
    }
}
