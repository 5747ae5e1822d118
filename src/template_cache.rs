//! # Template store
//!
//! Persists stellar templates on disk and hands them back on later runs, so that an unchanged
//! sub-instrument is never stacked twice.
//!
//! ## Layout
//! -----------------
//! ```text
//! <root>/<instrument>/Stellar_<sub_instrument>_<fingerprint>.parquet
//! <root>/<instrument>/Stellar_<sub_instrument>_<fingerprint>.json
//! ```
//!
//! The Parquet file holds one row per template pixel:
//!
//! | column | type |
//! |---|---|
//! | `order` | UInt32 |
//! | `pixel` | UInt32 |
//! | `wavelength` | Float64 |
//! | `flux` | Float64 |
//! | `uncertainty` | Float64 |
//! | `masked` | Boolean |
//!
//! The JSON sidecar ([`TemplateSidecar`]) stores the storage format version, the configuration
//! fingerprint, the array shape and the provenance. It is written **after** the Parquet file, so
//! an artifact without sidecar is incomplete and ignored. A sidecar whose fingerprint or format
//! version disagrees with the request is a cache miss. Float64 columns round-trip bit for bit.
//!
//! ## Reuse
//! -----------------
//! [`TemplateStore::load_or_build`] follows the [`CacheMode`]: `Reuse` returns a stored template
//! when one matches and builds otherwise, `ForceRebuild` always builds and overwrites, `Disabled`
//! builds without touching the disk. A failed build never writes anything.

use std::fs::File;
use std::io;
use std::sync::Arc;

use arrow_array::{Array, ArrayRef, BooleanArray, Float64Array, RecordBatch, UInt32Array};
use arrow_schema::{DataType, Field, Schema};
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info, warn};
use ndarray::Array2;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};

use crate::config::CacheMode;
use crate::constants::{ConfigFingerprint, STORAGE_FORMAT_VERSION};
use crate::partition::PartitionKey;
use crate::specstack_errors::{ErrorKind, SpecStackError};
use crate::template::{StellarTemplate, TemplateProvenance};

/// Metadata written next to every stored template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSidecar {
    pub format_version: u32,
    pub fingerprint: ConfigFingerprint,
    pub shape: (usize, usize),
    pub provenance: TemplateProvenance,
}

/// Where a template returned by [`TemplateStore::load_or_build`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOutcome {
    Reused,
    Built,
    /// Built with the cache disabled; nothing was written.
    BuiltUncached,
}

#[derive(Debug, Clone)]
pub struct TemplateStore {
    root: Utf8PathBuf,
}

impl TemplateStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        TemplateStore { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Paths of the Parquet file and JSON sidecar of a template.
    pub fn artifact_paths(
        &self,
        key: &PartitionKey,
        fingerprint: ConfigFingerprint,
    ) -> (Utf8PathBuf, Utf8PathBuf) {
        let stem = format!("Stellar_{}_{}", key.sub_instrument, fingerprint);
        let dir = self.root.join(&key.instrument);
        (
            dir.join(format!("{stem}.parquet")),
            dir.join(format!("{stem}.json")),
        )
    }

    /// `true` when a complete artifact exists for `key` and `fingerprint`.
    pub fn contains(&self, key: &PartitionKey, fingerprint: ConfigFingerprint) -> bool {
        let (data, sidecar) = self.artifact_paths(key, fingerprint);
        data.is_file() && sidecar.is_file()
    }

    /// Write a template, replacing any previous artifact with the same key and fingerprint.
    pub fn store(
        &self,
        key: &PartitionKey,
        fingerprint: ConfigFingerprint,
        template: &StellarTemplate,
    ) -> Result<(), SpecStackError> {
        let (data_path, sidecar_path) = self.artifact_paths(key, fingerprint);
        if let Some(dir) = data_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        // a stale sidecar must not validate a half-written data file
        if sidecar_path.exists() {
            std::fs::remove_file(&sidecar_path)?;
        }

        let tmp_data = data_path.with_extension("parquet.tmp");
        write_parquet(&tmp_data, template)?;
        std::fs::rename(&tmp_data, &data_path)?;

        let sidecar = TemplateSidecar {
            format_version: STORAGE_FORMAT_VERSION,
            fingerprint,
            shape: template.shape(),
            provenance: template.provenance.clone(),
        };
        let tmp_sidecar = sidecar_path.with_extension("json.tmp");
        std::fs::write(&tmp_sidecar, serde_json::to_vec_pretty(&sidecar)?)?;
        std::fs::rename(&tmp_sidecar, &sidecar_path)?;

        info!("{key}: template stored in {data_path}");
        Ok(())
    }

    /// Read a stored template.
    ///
    /// Return
    /// ----------
    /// * [`SpecStackError::TemplateNotFound`] when no complete artifact matches `fingerprint`
    ///   and the current storage format.
    /// * [`SpecStackError::CorruptTemplate`] when the data file disagrees with its sidecar.
    pub fn load(
        &self,
        key: &PartitionKey,
        fingerprint: ConfigFingerprint,
    ) -> Result<StellarTemplate, SpecStackError> {
        let (data_path, sidecar_path) = self.artifact_paths(key, fingerprint);
        if !self.contains(key, fingerprint) {
            return Err(SpecStackError::TemplateNotFound(data_path.to_string()));
        }

        let sidecar: TemplateSidecar =
            serde_json::from_reader(io::BufReader::new(File::open(&sidecar_path)?))?;
        if sidecar.fingerprint != fingerprint || sidecar.format_version != STORAGE_FORMAT_VERSION {
            debug!(
                "{key}: sidecar {sidecar_path} has fingerprint {} (format {}), wanted {fingerprint}",
                sidecar.fingerprint, sidecar.format_version
            );
            return Err(SpecStackError::TemplateNotFound(data_path.to_string()));
        }

        let (wavelengths, flux, uncertainties, mask) = read_parquet(&data_path, sidecar.shape)?;
        Ok(StellarTemplate {
            wavelengths,
            flux,
            uncertainties,
            mask,
            provenance: sidecar.provenance,
        })
    }

    /// Return the stored template for `fingerprint`, or build, store and return it.
    ///
    /// Arguments
    /// -----------------
    /// * `key`: partition the template belongs to
    /// * `fingerprint`: fingerprint of every output-affecting parameter
    /// * `mode`: see [`CacheMode`]
    /// * `build`: computes the template; called at most once
    ///
    /// Return
    /// ----------
    /// * The template and where it came from. Errors of `build` are returned unchanged and leave
    ///   the store untouched.
    pub fn load_or_build<F>(
        &self,
        key: &PartitionKey,
        fingerprint: ConfigFingerprint,
        mode: CacheMode,
        build: F,
    ) -> Result<(StellarTemplate, CacheOutcome), SpecStackError>
    where
        F: FnOnce() -> Result<StellarTemplate, SpecStackError>,
    {
        match mode {
            CacheMode::Disabled => Ok((build()?, CacheOutcome::BuiltUncached)),
            CacheMode::ForceRebuild => {
                let template = build()?;
                self.store(key, fingerprint, &template)?;
                Ok((template, CacheOutcome::Built))
            }
            CacheMode::Reuse => {
                match self.load(key, fingerprint) {
                    Ok(template) => {
                        info!("{key}: reusing stored template {fingerprint}");
                        return Ok((template, CacheOutcome::Reused));
                    }
                    Err(SpecStackError::TemplateNotFound(_)) => {
                        debug!("{key}: no stored template for {fingerprint}");
                    }
                    Err(err) if err.kind() == ErrorKind::Storage => {
                        warn!("{key}: stored template {fingerprint} is unreadable ({err}), rebuilding");
                    }
                    Err(err) => return Err(err),
                }
                let template = build()?;
                self.store(key, fingerprint, &template)?;
                Ok((template, CacheOutcome::Built))
            }
        }
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32, SpecStackError> {
    u32::try_from(value).map_err(|_| {
        SpecStackError::CorruptTemplate(format!("{what} index {value} does not fit in UInt32"))
    })
}

fn write_parquet(path: &Utf8Path, template: &StellarTemplate) -> Result<(), SpecStackError> {
    let (n_orders, n_pixels) = template.shape();
    let size = n_orders * n_pixels;
    let mut orders = Vec::with_capacity(size);
    let mut pixels = Vec::with_capacity(size);
    for order in 0..n_orders {
        for pixel in 0..n_pixels {
            orders.push(to_u32(order, "order")?);
            pixels.push(to_u32(pixel, "pixel")?);
        }
    }
    // standard layout iteration is row-major, matching the (order, pixel) rows above
    let column = |a: &Array2<f64>| -> ArrayRef { Arc::new(Float64Array::from_iter_values(a.iter().copied())) };

    let schema = Arc::new(Schema::new(vec![
        Field::new("order", DataType::UInt32, false),
        Field::new("pixel", DataType::UInt32, false),
        Field::new("wavelength", DataType::Float64, false),
        Field::new("flux", DataType::Float64, false),
        Field::new("uncertainty", DataType::Float64, false),
        Field::new("masked", DataType::Boolean, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(UInt32Array::from(orders)) as ArrayRef,
            Arc::new(UInt32Array::from(pixels)) as ArrayRef,
            column(&template.wavelengths),
            column(&template.flux),
            column(&template.uncertainties),
            Arc::new(BooleanArray::from(template.mask.iter().copied().collect::<Vec<bool>>()))
                as ArrayRef,
        ],
    )?;

    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

type TemplateArrays = (Array2<f64>, Array2<f64>, Array2<f64>, Array2<bool>);

fn downcast<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, SpecStackError> {
    let column = batch.column_by_name(name).ok_or_else(|| {
        SpecStackError::CorruptTemplate(format!("column '{name}' not found in schema"))
    })?;
    if column.null_count() > 0 {
        return Err(SpecStackError::CorruptTemplate(format!(
            "column '{name}' contains nulls"
        )));
    }
    column
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| SpecStackError::CorruptTemplate(format!("column '{name}' has the wrong type")))
}

fn read_parquet(
    path: &Utf8Path,
    shape: (usize, usize),
) -> Result<TemplateArrays, SpecStackError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut wavelengths = Array2::<f64>::zeros(shape);
    let mut flux = Array2::<f64>::zeros(shape);
    let mut uncertainties = Array2::<f64>::zeros(shape);
    let mut mask = Array2::from_elem(shape, false);
    let mut seen = Array2::from_elem(shape, false);

    for maybe_batch in reader {
        let batch = maybe_batch?;
        let order = downcast::<UInt32Array>(&batch, "order")?;
        let pixel = downcast::<UInt32Array>(&batch, "pixel")?;
        let wave = downcast::<Float64Array>(&batch, "wavelength")?;
        let fl = downcast::<Float64Array>(&batch, "flux")?;
        let unc = downcast::<Float64Array>(&batch, "uncertainty")?;
        let masked = downcast::<BooleanArray>(&batch, "masked")?;

        for row in 0..batch.num_rows() {
            let idx = (order.value(row) as usize, pixel.value(row) as usize);
            match seen.get_mut(idx) {
                Some(flag) if !*flag => *flag = true,
                Some(_) => {
                    return Err(SpecStackError::CorruptTemplate(format!(
                        "{path}: pixel {idx:?} stored twice"
                    )))
                }
                None => {
                    return Err(SpecStackError::CorruptTemplate(format!(
                        "{path}: pixel {idx:?} outside the shape {shape:?}"
                    )))
                }
            }
            wavelengths[idx] = wave.value(row);
            flux[idx] = fl.value(row);
            uncertainties[idx] = unc.value(row);
            mask[idx] = masked.value(row);
        }
    }

    if seen.iter().any(|s| !*s) {
        return Err(SpecStackError::CorruptTemplate(format!(
            "{path}: some pixels of the {shape:?} template are missing"
        )));
    }
    Ok((wavelengths, flux, uncertainties, mask))
}
