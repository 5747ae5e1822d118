//! Boundary with the per-instrument readers.
//!
//! The core never parses instrument files. Every spectrograph is handled by an implementation of
//! [`FrameProvider`] selected by the caller; the core only asks for descriptors and, when it needs
//! them, for the arrays of one observation at a time.

use std::collections::HashMap;

use ahash::RandomState;
use serde::{Deserialize, Serialize};

use crate::constants::FrameId;
use crate::frame::{Frame, FrameArrays, FrameDescriptor};
use crate::specstack_errors::SpecStackError;

/// Source of observations for one instrument.
///
/// Implementations must be shareable across the worker threads that process partitions in
/// parallel; `load` is a blocking call and retries, if any, belong to the implementation.
pub trait FrameProvider: Send + Sync {
    /// Metadata of every observation the provider knows about, in a stable order.
    fn descriptors(&self) -> Vec<FrameDescriptor>;

    /// Materialize the arrays of one observation.
    fn load(&self, id: FrameId) -> Result<FrameArrays, SpecStackError>;
}

/// Provider over observations already held in memory (tests, notebooks, small datasets).
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvider {
    order: Vec<FrameId>,
    frames: HashMap<FrameId, (FrameDescriptor, FrameArrays), RandomState>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a frame; a frame with the same identity replaces the previous one.
    pub fn insert(&mut self, frame: Frame) {
        let id = frame.id();
        let descriptor = frame.descriptor().clone();
        if !self.frames.contains_key(&id) {
            self.order.push(id);
        }
        self.frames.insert(id, (descriptor, frame.into_arrays()));
    }

    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.insert(frame);
        self
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl FromIterator<Frame> for InMemoryProvider {
    fn from_iter<T: IntoIterator<Item = Frame>>(iter: T) -> Self {
        let mut provider = InMemoryProvider::new();
        for frame in iter {
            provider.insert(frame);
        }
        provider
    }
}

impl FrameProvider for InMemoryProvider {
    fn descriptors(&self) -> Vec<FrameDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.frames.get(id).map(|(d, _)| d.clone()))
            .collect()
    }

    fn load(&self, id: FrameId) -> Result<FrameArrays, SpecStackError> {
        self.frames
            .get(&id)
            .map(|(_, arrays)| arrays.clone())
            .ok_or(SpecStackError::FrameNotFound(id))
    }
}

/// Serializable copy of a dataset's frames, handed to other processes.
///
/// The snapshot carries the arrays **with the partition masks already merged**, so a worker
/// rebuilding a [`Dataset`](crate::dataset::Dataset) from it reads exactly what the parent read.
/// Readers never mutate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSnapshot {
    pub frames: Vec<(FrameDescriptor, FrameArrays)>,
}

impl DatasetSnapshot {
    pub fn to_json(&self) -> Result<String, SpecStackError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SpecStackError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// [`FrameProvider`] reading from a [`DatasetSnapshot`].
#[derive(Debug, Clone)]
pub struct SnapshotProvider {
    inner: InMemoryProvider,
}

impl From<DatasetSnapshot> for SnapshotProvider {
    fn from(snapshot: DatasetSnapshot) -> Self {
        let inner = snapshot
            .frames
            .into_iter()
            .map(|(descriptor, arrays)| Frame::new(descriptor, arrays))
            .collect();
        SnapshotProvider { inner }
    }
}

impl FrameProvider for SnapshotProvider {
    fn descriptors(&self) -> Vec<FrameDescriptor> {
        self.inner.descriptors()
    }

    fn load(&self, id: FrameId) -> Result<FrameArrays, SpecStackError> {
        self.inner.load(id)
    }
}

#[cfg(test)]
mod provider_test {
    use super::*;
    use crate::frame::frame_test::linear_frame;

    #[test]
    fn in_memory_keeps_insertion_order() {
        let provider: InMemoryProvider = ["c.fits", "a.fits", "b.fits"]
            .iter()
            .map(|p| linear_frame(p, 1, 4, 5000.0, 0.1, 1.0))
            .collect();
        let paths: Vec<_> = provider
            .descriptors()
            .into_iter()
            .map(|d| d.source_path.to_string())
            .collect();
        assert_eq!(paths, vec!["c.fits", "a.fits", "b.fits"]);
    }

    #[test]
    fn missing_frame_is_reported() {
        let provider = InMemoryProvider::new();
        let id = FrameId::from_path("nope.fits");
        assert_eq!(provider.load(id), Err(SpecStackError::FrameNotFound(id)));
    }

    #[test]
    fn snapshot_survives_json() {
        let frame = linear_frame("s.fits", 2, 4, 5000.0, 0.1, 3.0);
        let snapshot = DatasetSnapshot {
            frames: vec![(frame.descriptor().clone(), frame.arrays().clone())],
        };
        let json = snapshot.to_json().unwrap();
        let provider = SnapshotProvider::from(DatasetSnapshot::from_json(&json).unwrap());
        let arrays = provider.load(frame.id()).unwrap();
        assert_eq!(arrays.flux, frame.arrays().flux);
        assert_eq!(arrays.mask, frame.arrays().mask);
        assert_eq!(provider.descriptors()[0], *frame.descriptor());
    }

    fn with_bad_pixels() -> Frame {
        let frame = linear_frame("bad.fits", 2, 8, 5000.0, 0.1, 1.0);
        let mut flux = frame.arrays().flux.clone();
        let mut errs = frame.arrays().uncertainties.clone();
        flux[[0, 5]] = f64::NAN;
        flux[[1, 2]] = f64::NEG_INFINITY;
        errs[[1, 6]] = f64::INFINITY;
        let arrays = FrameArrays::new(
            frame.arrays().wavelengths.clone(),
            flux,
            errs,
            frame.arrays().mask.clone(),
            vec![true, true],
        )
        .unwrap();
        Frame::new(frame.descriptor().clone(), arrays)
    }

    #[test]
    fn non_finite_pixels_survive_json() {
        let frame = with_bad_pixels();
        let snapshot = DatasetSnapshot {
            frames: vec![(frame.descriptor().clone(), frame.arrays().clone())],
        };
        let back = DatasetSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        let arrays = &back.frames[0].1;

        assert!(arrays.flux[[0, 5]].is_nan());
        assert_eq!(arrays.flux[[1, 2]], f64::NEG_INFINITY);
        assert_eq!(arrays.uncertainties[[1, 6]], f64::INFINITY);
        assert_eq!(arrays.mask, frame.arrays().mask);
        assert!(arrays.mask[[0, 5]] && arrays.mask[[1, 2]] && arrays.mask[[1, 6]]);
        assert_eq!(arrays.wavelengths, frame.arrays().wavelengths);
        assert_eq!(arrays.flux[[0, 4]].to_bits(), frame.arrays().flux[[0, 4]].to_bits());
    }

    fn tampered(
        edit: impl FnOnce(&mut serde_json::Value),
    ) -> Result<DatasetSnapshot, SpecStackError> {
        let frame = linear_frame("t.fits", 2, 10, 5000.0, 0.1, 1.0);
        let snapshot = DatasetSnapshot {
            frames: vec![(frame.descriptor().clone(), frame.arrays().clone())],
        };
        let mut value = serde_json::to_value(&snapshot).unwrap();
        edit(&mut value["frames"][0][1]);
        DatasetSnapshot::from_json(&value.to_string())
    }

    #[test]
    fn malformed_arrays_are_refused_when_read() {
        assert!(tampered(|_| {}).is_ok());

        let short_flux = tampered(|arrays| {
            let cells = arrays["flux"].as_array_mut().unwrap();
            cells.truncate(cells.len() - 10);
        });
        assert!(matches!(short_flux, Err(SpecStackError::JsonError(_))));

        let wrong_orders = tampered(|arrays| arrays["order_status"] = serde_json::json!([true]));
        let err = wrong_orders.unwrap_err().to_string();
        assert!(err.contains("order flags"), "{err}");

        let not_a_float = tampered(|arrays| arrays["flux"][0] = serde_json::json!("lots"));
        assert!(not_a_float.is_err());
    }
}
