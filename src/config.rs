//! # Pipeline configuration
//!
//! Every knob of the pipeline lives in one statically typed schema, [`PipelineConfig`], made of
//! one section per component:
//!
//! | Section | Consumer |
//! |---|---|
//! | [`MaskConfig`] | [`MaskBuilder`](crate::mask::MaskBuilder) |
//! | [`TelluricConfig`] | [`TelluricModel`](crate::telluric::TelluricModel) |
//! | [`TemplateConfig`] | [`TemplateBuilder`](crate::template::TemplateBuilder) |
//! | [`CacheMode`], `tolerate_missing_telluric` | [`StackPipeline`](crate::pipeline::StackPipeline) |
//!
//! The configuration is validated **once**, either by the builders' `build()` or by
//! [`PipelineConfig::validate`] after reading a JSON file; components then only read typed fields.
//!
//! ## Fingerprint
//! -----------------
//! [`PipelineConfig::fingerprint`] hashes every parameter that changes numeric output (mask,
//! telluric and template sections, the storage format version and, when a telluric model is
//! used, the identity of its inputs) into a [`ConfigFingerprint`]. The cache mode and failure tolerance are not part of it. Stored
//! templates are keyed by this fingerprint.
//!
//! ## Example
//! -----------------
//! ```rust,no_run
//! use specstack::config::{PipelineConfig, TemplateConfig};
//! use specstack::template::InclusionPolicy;
//!
//! let template = TemplateConfig::builder()
//!     .min_frames(5)
//!     .inclusion(InclusionPolicy::Intersection)
//!     .build()
//!     .unwrap();
//! let config = PipelineConfig {
//!     template,
//!     ..PipelineConfig::default()
//! };
//! println!("{}", config.fingerprint().unwrap());
//! ```

use std::fmt;
use std::str::FromStr;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::constants::{ConfigFingerprint, STORAGE_FORMAT_VERSION};
use crate::mask::berv::BervSource;
use crate::mask::{MaskBuilder, TELLURIC_PREFIX};
use crate::specstack_errors::SpecStackError;
use crate::template::interpolation::InterpolationMode;
use crate::template::stacking::StackingMode;
use crate::template::{DopplerFormula, InclusionPolicy, ReferenceSelection, RvSource};

// -------------------------------------------------------------------------------------------------
// Mask
// -------------------------------------------------------------------------------------------------

/// Extra region to exclude, declared in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInterval {
    pub name: String,
    pub start: f64,
    pub end: f64,
}

/// Parameters of the mask builder.
///
/// Defaults
/// -----------------
/// * `berv_source`: fixed 30 km/s
/// * `activity_lines`: `true`
/// * `user_intervals`: none
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    pub berv_source: BervSource,
    pub activity_lines: bool,
    pub user_intervals: Vec<UserInterval>,
}

impl Default for MaskConfig {
    fn default() -> Self {
        MaskConfig {
            berv_source: BervSource::default(),
            activity_lines: true,
            user_intervals: Vec::new(),
        }
    }
}

impl MaskConfig {
    pub fn builder() -> MaskConfigBuilder {
        MaskConfigBuilder::default()
    }

    /// Check the BERV source and the user intervals.
    ///
    /// Return
    /// ----------
    /// * [`SpecStackError::InvalidParameter`] for an empty or reserved (`telluric_*`) name, or
    ///   bounds that are not finite, not positive, or reversed.
    /// * [`SpecStackError::DuplicateInterval`] when a user interval repeats another user interval
    ///   or an enabled activity line.
    pub fn validate(&self) -> Result<(), SpecStackError> {
        self.berv_source.validate()?;
        for user in &self.user_intervals {
            if user.name.trim().is_empty() {
                return Err(SpecStackError::InvalidParameter(
                    "user interval names must not be empty".into(),
                ));
            }
            if user.name.starts_with(TELLURIC_PREFIX) {
                return Err(SpecStackError::InvalidParameter(format!(
                    "user interval '{}' uses the reserved prefix '{TELLURIC_PREFIX}'",
                    user.name
                )));
            }
            let positive = user.start.is_finite() && user.end.is_finite() && user.start > 0.0;
            if !(positive && user.start <= user.end) {
                return Err(SpecStackError::InvalidParameter(format!(
                    "user interval '{}' has invalid bounds [{}, {}]",
                    user.name, user.start, user.end
                )));
            }
        }
        // same registration as every partition will do
        MaskBuilder::new(self).map(|_| ())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaskConfigBuilder {
    config: MaskConfig,
}

impl MaskConfigBuilder {
    pub fn berv_source(mut self, v: BervSource) -> Self {
        self.config.berv_source = v;
        self
    }
    pub fn activity_lines(mut self, v: bool) -> Self {
        self.config.activity_lines = v;
        self
    }
    pub fn user_interval(mut self, name: &str, start: f64, end: f64) -> Self {
        self.config.user_intervals.push(UserInterval {
            name: name.to_string(),
            start,
            end,
        });
        self
    }

    pub fn build(self) -> Result<MaskConfig, SpecStackError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// -------------------------------------------------------------------------------------------------
// Telluric
// -------------------------------------------------------------------------------------------------

/// Parameters of the telluric model.
///
/// * `threshold_percent`: a wavelength is telluric when the simulated absorption `1 − T(λ)`
///   exceeds `threshold_percent / 100` (default 1 %).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelluricConfig {
    pub threshold_percent: f64,
}

impl Default for TelluricConfig {
    fn default() -> Self {
        TelluricConfig {
            threshold_percent: 1.0,
        }
    }
}

impl TelluricConfig {
    pub fn validate(&self) -> Result<(), SpecStackError> {
        if !(self.threshold_percent > 0.0 && self.threshold_percent < 100.0) {
            return Err(SpecStackError::InvalidParameter(format!(
                "telluric threshold must lie in (0, 100) %, got {}",
                self.threshold_percent
            )));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------
// Template
// -------------------------------------------------------------------------------------------------

/// Parameters of the stellar template builder.
///
/// Defaults
/// -----------------
/// * `min_frames`: 3
/// * `reference`: first valid frame
/// * `rv_source`: prior RVs
/// * `doppler`: classical
/// * `interpolation`: cubic
/// * `stacking`: inverse-variance weighted mean
/// * `inclusion`: union
/// * `min_template_flux`: none
/// * `bad_order_margin`: 100 pixels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub min_frames: usize,
    pub reference: ReferenceSelection,
    pub rv_source: RvSource,
    pub doppler: DopplerFormula,
    pub interpolation: InterpolationMode,
    pub stacking: StackingMode,
    pub inclusion: InclusionPolicy,
    /// Template pixels whose stacked flux falls below this value are masked.
    pub min_template_flux: Option<f64>,
    /// An order is reported as bad when more than `pixels - bad_order_margin` pixels are masked.
    pub bad_order_margin: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        TemplateConfig {
            min_frames: 3,
            reference: ReferenceSelection::default(),
            rv_source: RvSource::default(),
            doppler: DopplerFormula::default(),
            interpolation: InterpolationMode::default(),
            stacking: StackingMode::default(),
            inclusion: InclusionPolicy::default(),
            min_template_flux: None,
            bad_order_margin: 100,
        }
    }
}

impl TemplateConfig {
    pub fn builder() -> TemplateConfigBuilder {
        TemplateConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), SpecStackError> {
        if self.min_frames == 0 {
            return Err(SpecStackError::InvalidParameter(
                "min_frames must be >= 1".into(),
            ));
        }
        if let Some(flux) = self.min_template_flux {
            if !flux.is_finite() {
                return Err(SpecStackError::InvalidParameter(
                    "min_template_flux must be finite".into(),
                ));
            }
        }
        self.interpolation.validate()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TemplateConfigBuilder {
    config: TemplateConfig,
}

impl TemplateConfigBuilder {
    pub fn min_frames(mut self, v: usize) -> Self {
        self.config.min_frames = v;
        self
    }
    pub fn reference(mut self, v: ReferenceSelection) -> Self {
        self.config.reference = v;
        self
    }
    pub fn rv_source(mut self, v: RvSource) -> Self {
        self.config.rv_source = v;
        self
    }
    pub fn doppler(mut self, v: DopplerFormula) -> Self {
        self.config.doppler = v;
        self
    }
    pub fn interpolation(mut self, v: InterpolationMode) -> Self {
        self.config.interpolation = v;
        self
    }
    pub fn stacking(mut self, v: StackingMode) -> Self {
        self.config.stacking = v;
        self
    }
    pub fn inclusion(mut self, v: InclusionPolicy) -> Self {
        self.config.inclusion = v;
        self
    }
    pub fn min_template_flux(mut self, v: f64) -> Self {
        self.config.min_template_flux = Some(v);
        self
    }
    pub fn bad_order_margin(mut self, v: usize) -> Self {
        self.config.bad_order_margin = v;
        self
    }

    pub fn build(self) -> Result<TemplateConfig, SpecStackError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// -------------------------------------------------------------------------------------------------
// Cache and pipeline
// -------------------------------------------------------------------------------------------------

/// How the template store is used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Return a stored template when its fingerprint matches, build otherwise.
    #[default]
    Reuse,
    /// Always build and overwrite the stored template.
    ForceRebuild,
    /// Build without reading or writing the store.
    Disabled,
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheMode::Reuse => "reuse",
            CacheMode::ForceRebuild => "force_rebuild",
            CacheMode::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for CacheMode {
    type Err = SpecStackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "reuse" => Ok(CacheMode::Reuse),
            "force_rebuild" | "rebuild" => Ok(CacheMode::ForceRebuild),
            "disabled" | "off" => Ok(CacheMode::Disabled),
            other => Err(SpecStackError::InvalidParameter(format!(
                "unknown cache mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mask: MaskConfig,
    pub telluric: TelluricConfig,
    pub template: TemplateConfig,
    pub cache_mode: CacheMode,
    /// Keep stacking a partition whose telluric mask could not be computed.
    pub tolerate_missing_telluric: bool,
}

/// The part of the configuration that changes numeric output.
#[derive(Serialize)]
struct FingerprintInput<'a> {
    format_version: u32,
    telluric_inputs: Option<&'a str>,
    mask: &'a MaskConfig,
    telluric: &'a TelluricConfig,
    template: &'a TemplateConfig,
}

impl PipelineConfig {
    /// Check every section.
    pub fn validate(&self) -> Result<(), SpecStackError> {
        self.mask.validate()?;
        self.telluric.validate()?;
        self.template.validate()
    }

    /// Read and validate a JSON configuration file. Missing fields take their default value.
    pub fn from_json_file(path: &Utf8Path) -> Result<Self, SpecStackError> {
        let file = std::fs::File::open(path)?;
        let config: PipelineConfig = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, SpecStackError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Stable identifier of every output-affecting parameter, for a pipeline without telluric
    /// model.
    pub fn fingerprint(&self) -> Result<ConfigFingerprint, SpecStackError> {
        self.fingerprint_with_telluric(None)
    }

    /// Same as [`PipelineConfig::fingerprint`], with the identity of the atmospheric archive and
    /// simulator feeding the telluric model
    /// ([`TelluricModel::identity`](crate::telluric::TelluricModel::identity)), if any.
    pub fn fingerprint_with_telluric(
        &self,
        telluric_inputs: Option<&str>,
    ) -> Result<ConfigFingerprint, SpecStackError> {
        let input = FingerprintInput {
            format_version: STORAGE_FORMAT_VERSION,
            telluric_inputs,
            mask: &self.mask,
            telluric: &self.telluric,
            template: &self.template,
        };
        let canonical = serde_json::to_vec(&input)?;
        Ok(ConfigFingerprint::from_canonical_bytes(&canonical))
    }
}
