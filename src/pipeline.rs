//! # Stacking pipeline
//!
//! Orchestrates, for every sub-instrument partition of a [`Dataset`]:
//!
//! 1. the telluric model (optional) on the most humid observation,
//! 2. the pixel mask (tellurics widened by the BERV, activity lines, user intervals), frozen into
//!    the partition,
//! 3. the stellar template, through the [`TemplateStore`].
//!
//! ## Failure isolation
//! -----------------
//! Configuration problems (invalid parameters, unknown instrument) stop the run before any numeric
//! work. After that, every partition gets its own [`PartitionOutcome`]: a failure in one
//! sub-instrument never aborts the others. Partitions without valid observations are
//! [`PartitionStatus::Skipped`]. Anything that made a partition's result less complete than
//! requested is listed in [`PartitionOutcome::degradations`] and logged.
//!
//! ## Missing tellurics
//! -----------------
//! When the telluric model fails (no atmospheric state, simulator error) and
//! `tolerate_missing_telluric` is set, the partition is stacked with activity and user intervals
//! only. Such a degraded template is returned but never written to the store, so that a later run
//! with working tellurics does not reuse it.
//!
//! ## Example
//! -----------------
//! ```rust,no_run
//! use specstack::config::PipelineConfig;
//! use specstack::dataset::Dataset;
//! use specstack::frame::provider::InMemoryProvider;
//! use specstack::pipeline::StackPipeline;
//! use specstack::template_cache::TemplateStore;
//!
//! let dataset = Dataset::new(InMemoryProvider::new());
//! let pipeline = StackPipeline::new(PipelineConfig::default(), TemplateStore::new("templates"))
//!     .unwrap();
//! let report = pipeline.run(&dataset).unwrap();
//! for (key, outcome) in report.iter() {
//!     println!("{key}: {:?}", outcome.status.cache_outcome());
//! }
//! ```
//!
//! ## See also
//! ------------
//! * [`crate::mask::MaskBuilder`]
//! * [`crate::telluric::TelluricModel`]
//! * [`crate::template::TemplateBuilder`]

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;

use crate::config::{CacheMode, PipelineConfig};
use crate::constants::{ConfigFingerprint, FrameId};
use crate::dataset::Dataset;
use crate::instruments::InstrumentEpochs;
use crate::mask::MaskBuilder;
use crate::partition::{PartitionKey, SubInstrumentPartition};
use crate::specstack_errors::{ErrorKind, SpecStackError};
use crate::telluric::archive::AtmosphericArchive;
use crate::telluric::{SelectionRule, TelluricModel, TelluricSummary, TransmittanceSimulator};
use crate::template::{StellarTemplate, TemplateBuilder};
use crate::template_cache::{CacheOutcome, TemplateStore};

/// Something that made a partition's result less complete than requested.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    /// Nothing was built for the partition.
    Skipped { reason: String },
    /// No observation had humidity metadata; the telluric model used this one.
    HumidityFallback { frame: FrameId },
    /// The mask was built without telluric intervals.
    MissingTelluric { reason: String },
}

#[derive(Debug)]
pub enum PartitionStatus {
    Built {
        template: StellarTemplate,
        cache: CacheOutcome,
    },
    Skipped,
    Failed(SpecStackError),
}

impl PartitionStatus {
    pub fn template(&self) -> Option<&StellarTemplate> {
        match self {
            PartitionStatus::Built { template, .. } => Some(template),
            _ => None,
        }
    }

    pub fn cache_outcome(&self) -> Option<CacheOutcome> {
        match self {
            PartitionStatus::Built { cache, .. } => Some(*cache),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SpecStackError> {
        match self {
            PartitionStatus::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Result of one sub-instrument.
#[derive(Debug)]
pub struct PartitionOutcome {
    pub n_frames: usize,
    pub n_valid: usize,
    /// `None` when the template was reused, or no telluric model is configured.
    pub telluric: Option<TelluricSummary>,
    /// Number of excluded pixels in the dataset mask, when one was built.
    pub masked_pixels: Option<usize>,
    pub status: PartitionStatus,
    pub degradations: Vec<Degradation>,
}

/// Outcome of every partition of a run, ordered by `(instrument, sub-instrument)`.
#[derive(Debug)]
pub struct PipelineReport {
    pub fingerprint: ConfigFingerprint,
    pub outcomes: BTreeMap<PartitionKey, PartitionOutcome>,
}

impl PipelineReport {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PartitionKey, &PartitionOutcome)> {
        self.outcomes.iter()
    }

    /// Outcome of the partition with this sub-instrument name.
    pub fn get(&self, sub_instrument: &str) -> Option<&PartitionOutcome> {
        self.outcomes
            .iter()
            .find(|(key, _)| key.sub_instrument.as_str() == sub_instrument)
            .map(|(_, outcome)| outcome)
    }

    pub fn template(&self, sub_instrument: &str) -> Option<&StellarTemplate> {
        self.get(sub_instrument).and_then(|o| o.status.template())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&PartitionKey, &SpecStackError)> {
        self.outcomes
            .iter()
            .filter_map(|(key, o)| o.status.error().map(|err| (key, err)))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &PartitionKey> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o.status, PartitionStatus::Skipped))
            .map(|(key, _)| key)
    }

    pub fn n_built(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| o.status.template().is_some())
            .count()
    }
}

pub struct StackPipeline {
    config: PipelineConfig,
    instruments: Vec<InstrumentEpochs>,
    telluric: Option<TelluricModel>,
    store: TemplateStore,
}

impl StackPipeline {
    /// Validate `config` and create a pipeline knowing the built-in instruments, without
    /// telluric model.
    pub fn new(config: PipelineConfig, store: TemplateStore) -> Result<Self, SpecStackError> {
        config.validate()?;
        Ok(StackPipeline {
            config,
            instruments: vec![
                InstrumentEpochs::espresso(),
                InstrumentEpochs::harps(),
                InstrumentEpochs::carmenes(),
                InstrumentEpochs::maroonx(),
            ],
            telluric: None,
            store,
        })
    }

    /// Replace the known instruments.
    pub fn with_instruments(mut self, instruments: Vec<InstrumentEpochs>) -> Self {
        self.instruments = instruments;
        self
    }

    /// Compute telluric intervals with the given collaborators.
    pub fn with_telluric(
        mut self,
        archive: Arc<dyn AtmosphericArchive>,
        simulator: Arc<dyn TransmittanceSimulator>,
    ) -> Self {
        self.telluric = Some(TelluricModel::new(&self.config.telluric, archive, simulator));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    /// Fingerprint under which this pipeline stores its templates.
    pub fn fingerprint(&self) -> Result<ConfigFingerprint, SpecStackError> {
        let telluric_inputs = self.telluric.as_ref().map(TelluricModel::identity);
        self.config.fingerprint_with_telluric(telluric_inputs.as_deref())
    }

    /// Process every partition of `dataset`, one after the other.
    ///
    /// Return
    /// ----------
    /// * The per-partition report, or a configuration error raised before any numeric work.
    pub fn run(&self, dataset: &Dataset) -> Result<PipelineReport, SpecStackError> {
        let fingerprint = self.fingerprint()?;
        let partitions = dataset.partitions(&self.instruments)?;
        info!(
            "Stacking {} partitions of {} observations (configuration {fingerprint})",
            partitions.len(),
            dataset.len()
        );
        let outcomes = partitions
            .iter()
            .map(|p| (p.key().clone(), self.process_partition(p, dataset, fingerprint)))
            .collect();
        Ok(PipelineReport {
            fingerprint,
            outcomes,
        })
    }

    /// Same as [`StackPipeline::run`], with partitions processed on the rayon thread pool.
    #[cfg(feature = "parallel")]
    pub fn run_par(&self, dataset: &Dataset) -> Result<PipelineReport, SpecStackError> {
        use rayon::prelude::*;

        let fingerprint = self.fingerprint()?;
        let partitions = dataset.partitions(&self.instruments)?;
        info!(
            "Stacking {} partitions of {} observations in parallel (configuration {fingerprint})",
            partitions.len(),
            dataset.len()
        );
        let outcomes = partitions
            .par_iter()
            .map(|p| (p.key().clone(), self.process_partition(p, dataset, fingerprint)))
            .collect::<Vec<_>>()
            .into_iter()
            .collect();
        Ok(PipelineReport {
            fingerprint,
            outcomes,
        })
    }

    /// Mask and template of one partition. Never fails: errors end up in the outcome.
    pub fn process_partition(
        &self,
        partition: &SubInstrumentPartition,
        dataset: &Dataset,
        fingerprint: ConfigFingerprint,
    ) -> PartitionOutcome {
        let key = partition.key();
        let mut outcome = PartitionOutcome {
            n_frames: partition.members().len(),
            n_valid: partition.n_valid(),
            telluric: None,
            masked_pixels: None,
            status: PartitionStatus::Skipped,
            degradations: Vec::new(),
        };

        if outcome.n_valid == 0 {
            let reason = format!("none of the {} observations is valid", outcome.n_frames);
            warn!("{key}: skipped, {reason}");
            outcome.degradations.push(Degradation::Skipped { reason });
            return outcome;
        }

        if self.config.cache_mode == CacheMode::Reuse {
            match self.store.load(key, fingerprint) {
                Ok(template) => {
                    info!("{key}: reusing stored template {fingerprint}");
                    outcome.status = PartitionStatus::Built {
                        template,
                        cache: CacheOutcome::Reused,
                    };
                    return outcome;
                }
                Err(SpecStackError::TemplateNotFound(_)) => {}
                Err(err) if err.kind() == ErrorKind::Storage => {
                    warn!("{key}: stored template {fingerprint} is unreadable ({err}), rebuilding");
                }
                Err(err) => {
                    error!("{key}: {err}");
                    outcome.status = PartitionStatus::Failed(err);
                    return outcome;
                }
            }
        }

        let status = match self.build(partition, dataset, fingerprint, &mut outcome) {
            Ok((template, cache)) => PartitionStatus::Built { template, cache },
            Err(err) if err.kind() == ErrorKind::InsufficientData => {
                warn!("{key}: {err}");
                PartitionStatus::Failed(err)
            }
            Err(err) => {
                error!("{key}: {err}");
                PartitionStatus::Failed(err)
            }
        };
        outcome.status = status;
        outcome
    }

    fn build(
        &self,
        partition: &SubInstrumentPartition,
        dataset: &Dataset,
        fingerprint: ConfigFingerprint,
        outcome: &mut PartitionOutcome,
    ) -> Result<(StellarTemplate, CacheOutcome), SpecStackError> {
        let key = partition.key();
        let mut mask_builder = MaskBuilder::new(&self.config.mask)?;

        if let Some(model) = &self.telluric {
            match model.compute(partition, dataset) {
                Ok(summary) => {
                    if summary.selection == SelectionRule::FirstFrameFallback {
                        outcome.degradations.push(Degradation::HumidityFallback {
                            frame: summary.selected_frame,
                        });
                    }
                    mask_builder.register_telluric(&summary.intervals)?;
                    outcome.telluric = Some(summary);
                }
                Err(err)
                    if self.config.tolerate_missing_telluric
                        && matches!(
                            err.kind(),
                            ErrorKind::DataUnavailable | ErrorKind::ExternalTool
                        ) =>
                {
                    warn!("{key}: continuing without telluric intervals: {err}");
                    outcome.degradations.push(Degradation::MissingTelluric {
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let mask = mask_builder.build_and_attach(partition, dataset)?;
        outcome.masked_pixels = Some(mask.count_masked());

        let degraded = outcome
            .degradations
            .iter()
            .any(|d| matches!(d, Degradation::MissingTelluric { .. }));
        let mode = if degraded || self.config.cache_mode == CacheMode::Disabled {
            CacheMode::Disabled
        } else {
            // a Reuse lookup already missed
            CacheMode::ForceRebuild
        };
        let builder = TemplateBuilder::new(&self.config.template);
        self.store
            .load_or_build(key, fingerprint, mode, || builder.build(partition, dataset))
    }
}

impl std::fmt::Debug for StackPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackPipeline")
            .field("config", &self.config)
            .field("instruments", &self.instruments.len())
            .field("telluric", &self.telluric.is_some())
            .field("store", &self.store.root())
            .finish()
    }
}
