//! # Dataset: lazy access to the observations of a run
//!
//! The [`Dataset`] keeps the [`FrameDescriptor`]s of every observation in memory, but the arrays
//! are only materialized when an operation asks for them. Loaded frames are handed out as
//! `Arc<Frame>` and the dataset only keeps a **weak** reference: as long as some operation holds a
//! frame, other requests reuse it; once the last holder drops it, the arrays are freed and the next
//! request goes back to the provider.
//!
//! Use [`Dataset::with_frame`] for scoped access: the frame is guaranteed to be released when the
//! closure returns (unless another holder still references it).
//!
//! The dataset is also where observations are split into sub-instrument partitions
//! ([`Dataset::partitions`]) and where a serializable [`DatasetSnapshot`] is produced for worker
//! processes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use ahash::RandomState;
use log::debug;
use parking_lot::Mutex;

use crate::constants::FrameId;
use crate::frame::provider::{DatasetSnapshot, FrameProvider};
use crate::frame::{Frame, FrameDescriptor};
use crate::instruments::InstrumentEpochs;
use crate::partition::{PartitionKey, SubInstrumentPartition};
use crate::specstack_errors::SpecStackError;

pub struct Dataset {
    provider: Box<dyn FrameProvider>,
    descriptors: Vec<FrameDescriptor>,
    index: HashMap<FrameId, usize, RandomState>,
    live: Mutex<HashMap<FrameId, Weak<Frame>, RandomState>>,
}

impl Dataset {
    /// Build a dataset over a provider. Only descriptors are read at this point.
    pub fn new(provider: impl FrameProvider + 'static) -> Self {
        let descriptors = provider.descriptors();
        let index = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id, i))
            .collect();
        Dataset {
            provider: Box::new(provider),
            descriptors,
            index,
            live: Mutex::new(HashMap::default()),
        }
    }

    pub fn descriptors(&self) -> &[FrameDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, id: FrameId) -> Option<&FrameDescriptor> {
        self.index.get(&id).map(|i| &self.descriptors[*i])
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Get a frame, materializing it through the provider if nobody holds it yet.
    ///
    /// The provider is called without holding the dataset lock, so different frames load
    /// concurrently. Arrays whose shapes disagree are refused with
    /// [`SpecStackError::ShapeMismatch`].
    pub fn load_frame(&self, id: FrameId) -> Result<Arc<Frame>, SpecStackError> {
        let descriptor = self
            .descriptor(id)
            .ok_or(SpecStackError::FrameNotFound(id))?
            .clone();

        if let Some(frame) = self.live.lock().get(&id).and_then(Weak::upgrade) {
            return Ok(frame);
        }

        debug!("Materializing frame {} from {}", id, descriptor.source_path);
        let arrays = self.provider.load(id)?;
        arrays.check_shapes()?;
        let loaded = Arc::new(Frame::new(descriptor, arrays));

        let mut live = self.live.lock();
        // someone else may have materialized it meanwhile; keep a single copy alive
        if let Some(frame) = live.get(&id).and_then(Weak::upgrade) {
            return Ok(frame);
        }
        live.insert(id, Arc::downgrade(&loaded));
        // forget entries whose frames were already released
        live.retain(|_, weak| weak.strong_count() > 0);
        Ok(loaded)
    }

    /// Run `f` on a frame and release it afterwards.
    pub fn with_frame<R>(
        &self,
        id: FrameId,
        f: impl FnOnce(&Frame) -> R,
    ) -> Result<R, SpecStackError> {
        let frame = self.load_frame(id)?;
        Ok(f(&frame))
    }

    /// Number of frames currently held in memory by someone.
    pub fn materialized_count(&self) -> usize {
        self.live
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Split the observations into sub-instrument partitions.
    ///
    /// Arguments
    /// -----------------
    /// * `instruments`: time divisions of every instrument present in the dataset
    ///
    /// Return
    /// ----------
    /// * Partitions ordered by `(instrument, sub-instrument)`; members keep the dataset order.
    ///   Every observation ends up in exactly one partition.
    /// * [`SpecStackError::UnknownInstrument`] if an observation comes from an instrument without
    ///   a description. This is raised before any numeric work.
    pub fn partitions(
        &self,
        instruments: &[InstrumentEpochs],
    ) -> Result<Vec<SubInstrumentPartition>, SpecStackError> {
        let mut groups: BTreeMap<PartitionKey, Vec<FrameDescriptor>> = BTreeMap::new();
        for descriptor in &self.descriptors {
            let epochs = instruments
                .iter()
                .find(|inst| inst.name().eq_ignore_ascii_case(&descriptor.instrument))
                .ok_or_else(|| SpecStackError::UnknownInstrument(descriptor.instrument.clone()))?;
            let key = PartitionKey {
                instrument: epochs.name().to_string(),
                sub_instrument: epochs.sub_instrument_at(descriptor.epoch).clone(),
            };
            groups.entry(key).or_default().push(descriptor.clone());
        }

        Ok(groups
            .into_iter()
            .map(|(key, members)| SubInstrumentPartition::new(key, members))
            .collect())
    }

    /// Serializable copy of the given partitions' frames, masks merged.
    pub fn snapshot(
        &self,
        partitions: &[SubInstrumentPartition],
    ) -> Result<DatasetSnapshot, SpecStackError> {
        let mut frames = Vec::new();
        for partition in partitions {
            for descriptor in partition.members() {
                let frame = partition.load_frame(self, descriptor.id)?;
                frames.push((frame.descriptor().clone(), frame.arrays().clone()));
            }
        }
        Ok(DatasetSnapshot { frames })
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("frames", &self.descriptors.len())
            .field("materialized", &self.materialized_count())
            .finish()
    }
}

#[cfg(test)]
mod dataset_test {
    use super::*;
    use crate::frame::frame_test::linear_frame;
    use crate::frame::provider::{InMemoryProvider, SnapshotProvider};
    use crate::frame::{FrameArrays, FrameDescriptor};
    use crate::time::calendar_day;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn frame_at(path: &str, instrument: &str, y: i32, m: u8, d: u8) -> Frame {
        let template = linear_frame(path, 1, 3, 5000.0, 0.1, 1.0);
        let desc = FrameDescriptor::new(path, instrument, calendar_day(y, m, d), 0.0);
        Frame::new(desc, template.arrays().clone())
    }

    #[test]
    fn frames_are_released_after_use() {
        let frame = linear_frame("r.fits", 1, 3, 5000.0, 0.1, 1.0);
        let id = frame.id();
        let dataset = Dataset::new(InMemoryProvider::new().with_frame(frame));

        let held = dataset.load_frame(id).unwrap();
        let again = dataset.load_frame(id).unwrap();
        assert!(Arc::ptr_eq(&held, &again));
        assert_eq!(dataset.materialized_count(), 1);

        drop(held);
        drop(again);
        assert_eq!(dataset.materialized_count(), 0);

        let n = dataset.with_frame(id, |f| f.valid_pixels(0).len()).unwrap();
        assert_eq!(n, 3);
        assert_eq!(dataset.materialized_count(), 0);
    }

    /// Provider that takes some time per load and records how many loads overlap.
    struct SlowProvider {
        inner: InMemoryProvider,
        in_flight: AtomicUsize,
        peak: Arc<AtomicUsize>,
    }

    impl FrameProvider for SlowProvider {
        fn descriptors(&self) -> Vec<FrameDescriptor> {
            self.inner.descriptors()
        }

        fn load(&self, id: FrameId) -> Result<FrameArrays, SpecStackError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(60));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.load(id)
        }
    }

    #[test]
    fn provider_loads_run_concurrently() {
        let a = linear_frame("a.fits", 1, 3, 5000.0, 0.1, 1.0);
        let b = linear_frame("b.fits", 1, 3, 5000.0, 0.1, 1.0);
        let ids = [a.id(), b.id()];
        let peak = Arc::new(AtomicUsize::new(0));
        let dataset = Dataset::new(SlowProvider {
            inner: vec![a, b].into_iter().collect(),
            in_flight: AtomicUsize::new(0),
            peak: Arc::clone(&peak),
        });

        std::thread::scope(|scope| {
            for id in ids {
                let dataset = &dataset;
                scope.spawn(move || dataset.load_frame(id).map(|f| f.id()));
            }
        });
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    /// Provider that ignores the shape rules.
    struct CarelessProvider(InMemoryProvider);

    impl FrameProvider for CarelessProvider {
        fn descriptors(&self) -> Vec<FrameDescriptor> {
            self.0.descriptors()
        }

        fn load(&self, id: FrameId) -> Result<FrameArrays, SpecStackError> {
            let mut arrays = self.0.load(id)?;
            arrays.flux = ndarray::Array2::zeros((1, 2));
            Ok(arrays)
        }
    }

    #[test]
    fn inconsistent_provider_arrays_are_refused() {
        let frame = linear_frame("c.fits", 1, 3, 5000.0, 0.1, 1.0);
        let id = frame.id();
        let dataset = Dataset::new(CarelessProvider(InMemoryProvider::new().with_frame(frame)));
        assert!(matches!(
            dataset.load_frame(id),
            Err(SpecStackError::ShapeMismatch(_))
        ));
        assert_eq!(dataset.materialized_count(), 0);
    }

    #[test]
    fn every_frame_lands_in_exactly_one_partition() {
        let provider: InMemoryProvider = vec![
            frame_at("e1.fits", "ESPRESSO", 2019, 1, 1),
            frame_at("h1.fits", "HARPS", 2010, 1, 1),
            frame_at("e2.fits", "ESPRESSO", 2021, 1, 1),
            frame_at("e3.fits", "espresso", 2019, 2, 1),
        ]
        .into_iter()
        .collect();
        let dataset = Dataset::new(provider);
        let partitions = dataset
            .partitions(&[InstrumentEpochs::espresso(), InstrumentEpochs::harps()])
            .unwrap();

        let names: Vec<_> = partitions
            .iter()
            .map(|p| (p.sub_instrument().to_string(), p.members().len()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("ESPRESSO18".to_string(), 2),
                ("ESPRESSO21".to_string(), 1),
                ("HARPS03".to_string(), 1)
            ]
        );
        let total: usize = partitions.iter().map(|p| p.members().len()).sum();
        assert_eq!(total, dataset.len());
    }

    #[test]
    fn unknown_instrument_is_a_configuration_error() {
        let provider = InMemoryProvider::new().with_frame(frame_at("x.fits", "NIRPS", 2023, 1, 1));
        let dataset = Dataset::new(provider);
        let err = dataset.partitions(&[InstrumentEpochs::harps()]).unwrap_err();
        assert_eq!(err, SpecStackError::UnknownInstrument("NIRPS".into()));
    }

    #[test]
    fn snapshot_feeds_a_worker_dataset() {
        let frame = frame_at("w.fits", "HARPS", 2016, 1, 1);
        let id = frame.id();
        let dataset = Dataset::new(InMemoryProvider::new().with_frame(frame));
        let partitions = dataset.partitions(&[InstrumentEpochs::harps()]).unwrap();
        let snapshot = dataset.snapshot(&partitions).unwrap();

        let worker = Dataset::new(SnapshotProvider::from(snapshot));
        let arrays: FrameArrays = worker.load_frame(id).unwrap().arrays().clone();
        assert_eq!(arrays, dataset.load_frame(id).unwrap().arrays().clone());
    }
}
