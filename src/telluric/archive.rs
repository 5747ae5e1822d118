//! Atmospheric states at observation time.
//!
//! The telluric model needs the state of the atmosphere (surface pressure, temperature, humidity,
//! optionally a reference to a vertical profile) closest in time to the selected observation. The
//! [`AtmosphericArchive`] trait is the boundary with whatever service provides them; the crate
//! ships [`AtmosphericRecords`], a sorted in-memory table that can be read from CSV.
//!
//! # CSV layout
//!
//! ```text
//! mjd,pressure_hpa,temperature_k,relative_humidity,profile
//! 59215.05,743.1,285.3,12.0,gdas_20210101_00
//! 59215.30,742.8,283.9,15.5,
//! ```
//!
//! The `profile` column may be left empty.

use std::io::Read;

use camino::Utf8Path;
use hifitime::Epoch;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::constants::ConfigFingerprint;
use crate::specstack_errors::SpecStackError;
use crate::time::{epoch_as_mjd, separation_seconds};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtmosphericState {
    #[serde(rename = "mjd", with = "epoch_as_mjd")]
    pub epoch: Epoch,
    pub pressure_hpa: f64,
    pub temperature_k: f64,
    pub relative_humidity: f64,
    #[serde(default)]
    pub profile: Option<String>,
}

/// Source of atmospheric states.
pub trait AtmosphericArchive: Send + Sync {
    /// State closest in time to `epoch`.
    ///
    /// Return
    /// ----------
    /// * [`SpecStackError::DataUnavailable`] when no state is close enough.
    fn closest_state(&self, epoch: Epoch) -> Result<AtmosphericState, SpecStackError>;

    /// Identity of the data behind the archive, folded into the configuration fingerprint.
    /// Archives with equal identities must return equal states.
    fn identity(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Time-sorted table of atmospheric states.
#[derive(Debug, Clone, PartialEq)]
pub struct AtmosphericRecords {
    records: Vec<AtmosphericState>,
    max_separation_hours: f64,
}

impl AtmosphericRecords {
    /// Arguments
    /// -----------------
    /// * `records`: states in any order
    /// * `max_separation_hours`: lookups further than this from every record report "not found"
    pub fn new(mut records: Vec<AtmosphericState>, max_separation_hours: f64) -> Self {
        records.sort_by(|a, b| a.epoch.cmp(&b.epoch));
        AtmosphericRecords {
            records,
            max_separation_hours,
        }
    }

    pub fn from_csv_reader<R: Read>(
        reader: R,
        max_separation_hours: f64,
    ) -> Result<Self, SpecStackError> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let records = csv_reader
            .deserialize::<AtmosphericState>()
            .collect::<Result<Vec<_>, _>>()?;
        debug!("Read {} atmospheric records", records.len());
        Ok(Self::new(records, max_separation_hours))
    }

    pub fn from_csv(path: &Utf8Path, max_separation_hours: f64) -> Result<Self, SpecStackError> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file, max_separation_hours)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AtmosphericArchive for AtmosphericRecords {
    fn closest_state(&self, epoch: Epoch) -> Result<AtmosphericState, SpecStackError> {
        let after = self.records.partition_point(|r| r.epoch < epoch);
        let candidates = [after.checked_sub(1), Some(after)];
        let closest = candidates
            .iter()
            .flatten()
            .filter_map(|i| self.records.get(*i))
            .min_by(|a, b| {
                separation_seconds(a.epoch, epoch).total_cmp(&separation_seconds(b.epoch, epoch))
            })
            .ok_or_else(|| {
                SpecStackError::DataUnavailable(format!("no atmospheric record at all for {epoch}"))
            })?;

        let hours = separation_seconds(closest.epoch, epoch) / 3600.0;
        if hours > self.max_separation_hours {
            return Err(SpecStackError::DataUnavailable(format!(
                "closest atmospheric record to {epoch} is {hours:.1} h away (limit {} h)",
                self.max_separation_hours
            )));
        }
        Ok(closest.clone())
    }

    /// Hash of every record and of the separation limit.
    fn identity(&self) -> String {
        let mut bytes = Vec::with_capacity(self.records.len() * 48 + 8);
        bytes.extend_from_slice(&self.max_separation_hours.to_bits().to_le_bytes());
        for record in &self.records {
            let (centuries, nanoseconds) = record.epoch.to_tai_duration().to_parts();
            bytes.extend_from_slice(&centuries.to_le_bytes());
            bytes.extend_from_slice(&nanoseconds.to_le_bytes());
            for value in [
                record.pressure_hpa,
                record.temperature_k,
                record.relative_humidity,
            ] {
                bytes.extend_from_slice(&value.to_bits().to_le_bytes());
            }
            bytes.extend_from_slice(record.profile.as_deref().unwrap_or("").as_bytes());
            bytes.push(0);
        }
        format!(
            "atmospheric_records:{}",
            ConfigFingerprint::from_canonical_bytes(&bytes)
        )
    }
}

#[cfg(test)]
mod archive_test {
    use super::*;
    use crate::time::epoch_from_mjd_utc;

    const CSV: &str = "mjd,pressure_hpa,temperature_k,relative_humidity,profile
59215.30,742.8,283.9,15.5,
59215.05,743.1,285.3,12.0,gdas_20210101_00
59216.00,741.0,280.0,40.0,gdas_20210102_00
";

    #[test]
    fn csv_records_are_sorted_and_optional_profile_is_read() {
        let records = AtmosphericRecords::from_csv_reader(CSV.as_bytes(), 6.0).unwrap();
        assert_eq!(records.len(), 3);
        let state = records.closest_state(epoch_from_mjd_utc(59215.0)).unwrap();
        assert_eq!(state.profile.as_deref(), Some("gdas_20210101_00"));
        let state = records.closest_state(epoch_from_mjd_utc(59215.25)).unwrap();
        assert_eq!(state.relative_humidity, 15.5);
        assert_eq!(state.profile, None);
    }

    #[test]
    fn lookups_too_far_away_are_unavailable() {
        let records = AtmosphericRecords::from_csv_reader(CSV.as_bytes(), 6.0).unwrap();
        let err = records.closest_state(epoch_from_mjd_utc(59230.0)).unwrap_err();
        assert!(matches!(err, SpecStackError::DataUnavailable(_)));
        let empty = AtmosphericRecords::new(vec![], 6.0);
        assert!(empty.closest_state(epoch_from_mjd_utc(59230.0)).is_err());
    }

    #[test]
    fn identity_follows_the_records() {
        let records = AtmosphericRecords::from_csv_reader(CSV.as_bytes(), 6.0).unwrap();
        let again = AtmosphericRecords::from_csv_reader(CSV.as_bytes(), 6.0).unwrap();
        assert_eq!(records.identity(), again.identity());

        let wetter = CSV.replace("40.0", "41.0");
        let wetter = AtmosphericRecords::from_csv_reader(wetter.as_bytes(), 6.0).unwrap();
        assert_ne!(records.identity(), wetter.identity());
        let looser = AtmosphericRecords::from_csv_reader(CSV.as_bytes(), 12.0).unwrap();
        assert_ne!(records.identity(), looser.identity());
    }
}
