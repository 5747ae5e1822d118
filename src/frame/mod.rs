//! # Frames: one observation's arrays and metadata
//!
//! A [`Frame`] holds the two-dimensional `(orders, pixels)` arrays of a single calibrated
//! observation together with its [`FrameDescriptor`] (the light-weight metadata that is always
//! kept in memory by the [`Dataset`](crate::dataset::Dataset)).
//!
//! ## Masking convention
//! -----------------
//! The pixel mask is **index-preserving**: a `true` entry means "exclude this pixel from every
//! numeric reduction", but the pixel itself is never removed from the arrays. Orders flagged as
//! invalid are treated as if every pixel were masked.
//!
//! ## Invariants
//! -----------------
//! * wavelengths, flux, uncertainties and mask always share the same `(orders, pixels)` shape,
//! * the per-order validity vector has one entry per order,
//! * a frame is only ever mutated to union an additional mask into it ([`Frame::apply_mask`]).
//!
//! ## See also
//! ------------
//! * [`provider::FrameProvider`] – Boundary with the per-instrument readers.
//! * [`crate::dataset::Dataset`] – Lazy materialization of frames.
pub mod provider;

use camino::Utf8PathBuf;
use hifitime::Epoch;
use ndarray::{Array2, ArrayView1, Zip};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::constants::{FrameId, KmPerSec};
use crate::specstack_errors::SpecStackError;
use crate::time::epoch_as_tai_parts;

/// Scalar metadata of an observation, available without loading its arrays.
///
/// # Fields
///
/// * `id` - Stable identity derived from `source_path`
/// * `source_path` - Path of the calibrated product the frame was read from
/// * `instrument` - Name of the spectrograph (e.g. `ESPRESSO`)
/// * `epoch` - Acquisition time
/// * `berv` - Barycentric Earth radial velocity, in km/s
/// * `humidity` - Relative humidity at acquisition time, in %, if the header provides it
/// * `prior_rv` - Externally supplied radial-velocity estimate of the star, in km/s
/// * `is_valid` - `false` when an upstream quality filter rejected the observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDescriptor {
    pub id: FrameId,
    pub source_path: Utf8PathBuf,
    pub instrument: String,
    #[serde(with = "epoch_as_tai_parts")]
    pub epoch: Epoch,
    pub berv: KmPerSec,
    pub humidity: Option<f64>,
    pub prior_rv: Option<KmPerSec>,
    pub is_valid: bool,
}

impl FrameDescriptor {
    /// Create a valid descriptor; the identity is derived from `source_path`.
    pub fn new(
        source_path: impl Into<Utf8PathBuf>,
        instrument: impl Into<String>,
        epoch: Epoch,
        berv: KmPerSec,
    ) -> Self {
        let source_path = source_path.into();
        FrameDescriptor {
            id: FrameId::from_path(source_path.as_str()),
            source_path,
            instrument: instrument.into(),
            epoch,
            berv,
            humidity: None,
            prior_rv: None,
            is_valid: true,
        }
    }

    pub fn with_humidity(mut self, humidity: f64) -> Self {
        self.humidity = Some(humidity);
        self
    }

    pub fn with_prior_rv(mut self, rv: KmPerSec) -> Self {
        self.prior_rv = Some(rv);
        self
    }

    pub fn invalidated(mut self) -> Self {
        self.is_valid = false;
        self
    }
}

/// The numeric content of an observation.
///
/// Arrays are shaped `(orders, pixels)`; see the module documentation for the masking rules.
///
/// The serialized form stores the shape once and every array as a flat row-major sequence.
/// Non-finite floats are written as the strings `"NaN"`, `"inf"` and `"-inf"`, so masked bad
/// pixels survive text formats. Deserialization goes through the same shape checks as
/// [`FrameArrays::new`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "FrameArraysRecord")]
pub struct FrameArrays {
    pub wavelengths: Array2<f64>,
    pub flux: Array2<f64>,
    pub uncertainties: Array2<f64>,
    pub mask: Array2<bool>,
    pub order_status: Vec<bool>,
}

impl FrameArrays {
    /// Bundle arrays after checking that their shapes agree.
    ///
    /// Pixels with a non-finite flux or a non-finite/non-positive uncertainty are added to the
    /// mask, so that downstream reductions never see them.
    ///
    /// Return
    /// ----------
    /// * The arrays, or [`SpecStackError::ShapeMismatch`] if any shape disagrees.
    pub fn new(
        wavelengths: Array2<f64>,
        flux: Array2<f64>,
        uncertainties: Array2<f64>,
        mask: Array2<bool>,
        order_status: Vec<bool>,
    ) -> Result<Self, SpecStackError> {
        let mut arrays = FrameArrays {
            wavelengths,
            flux,
            uncertainties,
            mask,
            order_status,
        };
        arrays.check_shapes()?;

        Zip::from(&mut arrays.mask)
            .and(&arrays.flux)
            .and(&arrays.uncertainties)
            .for_each(|m, f, u| {
                if !f.is_finite() || !u.is_finite() || *u <= 0.0 {
                    *m = true;
                }
            });
        Ok(arrays)
    }

    /// Check that every array has the shape of `wavelengths` and that there is one order flag
    /// per order.
    pub fn check_shapes(&self) -> Result<(), SpecStackError> {
        let dim = self.wavelengths.dim();
        if self.flux.dim() != dim || self.uncertainties.dim() != dim || self.mask.dim() != dim {
            return Err(SpecStackError::ShapeMismatch(format!(
                "wavelengths {:?}, flux {:?}, uncertainties {:?}, mask {:?}",
                dim,
                self.flux.dim(),
                self.uncertainties.dim(),
                self.mask.dim()
            )));
        }
        if self.order_status.len() != dim.0 {
            return Err(SpecStackError::ShapeMismatch(format!(
                "{} order flags for {} orders",
                self.order_status.len(),
                dim.0
            )));
        }
        Ok(())
    }

    /// Arrays with every pixel valid and every order usable.
    pub fn unmasked(
        wavelengths: Array2<f64>,
        flux: Array2<f64>,
        uncertainties: Array2<f64>,
    ) -> Result<Self, SpecStackError> {
        let dim = wavelengths.dim();
        Self::new(
            wavelengths,
            flux,
            uncertainties,
            Array2::from_elem(dim, false),
            vec![true; dim.0],
        )
    }
}

/// A float as written by [`FrameArrays`]: a number, or a string for non-finite values.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireFloat {
    Finite(f64),
    Special(String),
}

impl From<f64> for WireFloat {
    fn from(value: f64) -> Self {
        if value.is_finite() {
            WireFloat::Finite(value)
        } else if value.is_nan() {
            WireFloat::Special("NaN".into())
        } else if value > 0.0 {
            WireFloat::Special("inf".into())
        } else {
            WireFloat::Special("-inf".into())
        }
    }
}

impl TryFrom<WireFloat> for f64 {
    type Error = SpecStackError;

    fn try_from(value: WireFloat) -> Result<Self, Self::Error> {
        match value {
            WireFloat::Finite(v) => Ok(v),
            WireFloat::Special(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(SpecStackError::InvalidParameter(format!(
                    "'{other}' is not a float"
                ))),
            },
        }
    }
}

struct FloatCells<'a>(&'a Array2<f64>);

impl Serialize for FloatCells<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(|v| WireFloat::from(*v)))
    }
}

#[derive(Deserialize)]
struct FrameArraysRecord {
    shape: (usize, usize),
    wavelengths: Vec<WireFloat>,
    flux: Vec<WireFloat>,
    uncertainties: Vec<WireFloat>,
    mask: Vec<bool>,
    order_status: Vec<bool>,
}

fn float_array(
    name: &str,
    shape: (usize, usize),
    cells: Vec<WireFloat>,
) -> Result<Array2<f64>, SpecStackError> {
    let values = cells
        .into_iter()
        .map(f64::try_from)
        .collect::<Result<Vec<f64>, _>>()?;
    let n = values.len();
    Array2::from_shape_vec(shape, values).map_err(|_| {
        SpecStackError::ShapeMismatch(format!("{name}: {n} values for shape {shape:?}"))
    })
}

impl TryFrom<FrameArraysRecord> for FrameArrays {
    type Error = SpecStackError;

    fn try_from(record: FrameArraysRecord) -> Result<Self, Self::Error> {
        let shape = record.shape;
        let n_mask = record.mask.len();
        let mask = Array2::from_shape_vec(shape, record.mask).map_err(|_| {
            SpecStackError::ShapeMismatch(format!("mask: {n_mask} flags for shape {shape:?}"))
        })?;
        let arrays = FrameArrays {
            wavelengths: float_array("wavelengths", shape, record.wavelengths)?,
            flux: float_array("flux", shape, record.flux)?,
            uncertainties: float_array("uncertainties", shape, record.uncertainties)?,
            mask,
            order_status: record.order_status,
        };
        arrays.check_shapes()?;
        Ok(arrays)
    }
}

impl Serialize for FrameArrays {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut record = serializer.serialize_struct("FrameArrays", 6)?;
        record.serialize_field("shape", &self.wavelengths.dim())?;
        record.serialize_field("wavelengths", &FloatCells(&self.wavelengths))?;
        record.serialize_field("flux", &FloatCells(&self.flux))?;
        record.serialize_field("uncertainties", &FloatCells(&self.uncertainties))?;
        record.serialize_field("mask", &self.mask.iter().collect::<Vec<_>>())?;
        record.serialize_field("order_status", &self.order_status)?;
        record.end()
    }
}

/// A materialized observation: descriptor plus arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    descriptor: FrameDescriptor,
    arrays: FrameArrays,
}

impl Frame {
    pub fn new(descriptor: FrameDescriptor, arrays: FrameArrays) -> Self {
        Frame { descriptor, arrays }
    }

    pub fn id(&self) -> FrameId {
        self.descriptor.id
    }

    pub fn descriptor(&self) -> &FrameDescriptor {
        &self.descriptor
    }

    pub fn arrays(&self) -> &FrameArrays {
        &self.arrays
    }

    pub fn into_arrays(self) -> FrameArrays {
        self.arrays
    }

    /// `(orders, pixels)`
    pub fn shape(&self) -> (usize, usize) {
        self.arrays.wavelengths.dim()
    }

    pub fn n_orders(&self) -> usize {
        self.shape().0
    }

    pub fn is_order_valid(&self, order: usize) -> bool {
        self.arrays.order_status.get(order).copied().unwrap_or(false)
    }

    pub fn order_wavelengths(&self, order: usize) -> ArrayView1<'_, f64> {
        self.arrays.wavelengths.row(order)
    }

    pub fn order_flux(&self, order: usize) -> ArrayView1<'_, f64> {
        self.arrays.flux.row(order)
    }

    pub fn order_uncertainties(&self, order: usize) -> ArrayView1<'_, f64> {
        self.arrays.uncertainties.row(order)
    }

    pub fn order_mask(&self, order: usize) -> ArrayView1<'_, bool> {
        self.arrays.mask.row(order)
    }

    /// Union an additional pixel mask into the frame's own mask.
    ///
    /// Return
    /// ----------
    /// * `Ok(())`, or [`SpecStackError::ShapeMismatch`] if the mask does not match the frame.
    pub fn apply_mask(&mut self, mask: &Array2<bool>) -> Result<(), SpecStackError> {
        if mask.dim() != self.shape() {
            return Err(SpecStackError::ShapeMismatch(format!(
                "mask {:?} cannot be applied to frame {} of shape {:?}",
                mask.dim(),
                self.id(),
                self.shape()
            )));
        }
        Zip::from(&mut self.arrays.mask)
            .and(mask)
            .for_each(|own, extra| *own |= *extra);
        Ok(())
    }

    /// Indices of the usable pixels of one order (order valid and pixel unmasked).
    pub fn valid_pixels(&self, order: usize) -> Vec<usize> {
        if !self.is_order_valid(order) {
            return Vec::new();
        }
        self.order_mask(order)
            .iter()
            .enumerate()
            .filter(|(_, masked)| !**masked)
            .map(|(i, _)| i)
            .collect()
    }

    /// Wavelength span covered by the usable pixels of the whole frame.
    pub fn valid_wavelength_range(&self) -> Option<(f64, f64)> {
        let mut range: Option<(f64, f64)> = None;
        for order in 0..self.n_orders() {
            let waves = self.order_wavelengths(order);
            for pixel in self.valid_pixels(order) {
                let w = waves[pixel];
                range = Some(match range {
                    None => (w, w),
                    Some((lo, hi)) => (lo.min(w), hi.max(w)),
                });
            }
        }
        range
    }
}

#[cfg(test)]
pub(crate) mod frame_test {
    use super::*;
    use crate::time::calendar_day;
    use ndarray::Array2;

    /// Frame with a linear wavelength solution `start + order * 100 + pixel * step`.
    pub(crate) fn linear_frame(
        path: &str,
        orders: usize,
        pixels: usize,
        start: f64,
        step: f64,
        flux: f64,
    ) -> Frame {
        let waves = Array2::from_shape_fn((orders, pixels), |(o, p)| {
            start + o as f64 * 100.0 + p as f64 * step
        });
        let fluxes = Array2::from_elem((orders, pixels), flux);
        let errs = Array2::from_elem((orders, pixels), 1.0);
        let desc = FrameDescriptor::new(path, "ESPRESSO", calendar_day(2021, 3, 1), 0.0);
        Frame::new(desc, FrameArrays::unmasked(waves, fluxes, errs).unwrap())
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let res = FrameArrays::unmasked(
            Array2::zeros((2, 10)),
            Array2::zeros((2, 9)),
            Array2::ones((2, 10)),
        );
        assert!(matches!(res, Err(SpecStackError::ShapeMismatch(_))));
    }

    #[test]
    fn bad_uncertainties_are_masked_not_removed() {
        let mut errs = Array2::ones((1, 4));
        errs[[0, 2]] = 0.0;
        let mut flux = Array2::ones((1, 4));
        flux[[0, 3]] = f64::NAN;
        let arrays = FrameArrays::unmasked(Array2::zeros((1, 4)), flux, errs).unwrap();
        assert_eq!(arrays.mask.row(0).to_vec(), vec![false, false, true, true]);
        assert_eq!(arrays.flux.dim(), (1, 4));
    }

    #[test]
    fn apply_mask_is_a_union() {
        let mut frame = linear_frame("a.fits", 1, 5, 5000.0, 0.1, 1.0);
        let mut extra = Array2::from_elem((1, 5), false);
        extra[[0, 1]] = true;
        frame.apply_mask(&extra).unwrap();
        extra[[0, 1]] = false;
        extra[[0, 4]] = true;
        frame.apply_mask(&extra).unwrap();
        assert_eq!(frame.valid_pixels(0), vec![0, 2, 3]);
        assert!(frame.apply_mask(&Array2::from_elem((2, 5), false)).is_err());
    }

    #[test]
    fn invalid_order_has_no_valid_pixels() {
        let waves = Array2::from_elem((2, 3), 5000.0);
        let arrays = FrameArrays::new(
            waves,
            Array2::ones((2, 3)),
            Array2::ones((2, 3)),
            Array2::from_elem((2, 3), false),
            vec![true, false],
        )
        .unwrap();
        let desc = FrameDescriptor::new("b.fits", "HARPS", calendar_day(2010, 1, 1), 0.0);
        let frame = Frame::new(desc, arrays);
        assert_eq!(frame.valid_pixels(0).len(), 3);
        assert!(frame.valid_pixels(1).is_empty());
    }
}
