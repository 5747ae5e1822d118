use hifitime::{Epoch, TimeScale};
use std::str::FromStr;

use crate::constants::MJD;
use crate::specstack_errors::SpecStackError;

/// Parse an ISO-8601 date (e.g. `2021-05-29T03:12:00`) given in UTC.
///
/// Argument
/// --------
/// * `date`: a date in the format YYYY-MM-ddTHH:mm:ss, optionally followed by a time scale
///
/// Return
/// ------
/// * the corresponding [`Epoch`], or [`SpecStackError::InvalidEpoch`]
pub fn parse_utc_date(date: &str) -> Result<Epoch, SpecStackError> {
    let trimmed = date.trim();
    let candidate = if trimmed.contains(' ') {
        trimmed.to_string()
    } else {
        format!("{trimmed} UTC")
    };
    Epoch::from_str(&candidate).map_err(|e| SpecStackError::InvalidEpoch(format!("{date}: {e}")))
}

/// Midnight UTC of a calendar day, used for instrument breakpoints.
pub fn calendar_day(year: i32, month: u8, day: u8) -> Epoch {
    Epoch::from_gregorian_utc_at_midnight(year, month, day)
}

/// Transformation from modified julian date (UTC) to an [`Epoch`]
pub fn epoch_from_mjd_utc(mjd: MJD) -> Epoch {
    Epoch::from_mjd_in_time_scale(mjd, TimeScale::UTC)
}

/// Absolute separation between two epochs, in seconds.
pub fn separation_seconds(a: Epoch, b: Epoch) -> f64 {
    (a - b).abs().to_seconds()
}

/// Serde adapter storing an [`Epoch`] as its MJD (UTC) value.
///
/// Used by the CSV atmospheric records. Precision is limited to the microsecond; use
/// [`epoch_as_tai_parts`] where an epoch must come back unchanged.
pub mod epoch_as_mjd {
    use hifitime::Epoch;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(epoch: &Epoch, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(epoch.to_mjd_utc_days())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Epoch, D::Error> {
        let mjd = f64::deserialize(deserializer)?;
        Ok(super::epoch_from_mjd_utc(mjd))
    }
}

/// Serde adapter storing an [`Epoch`] as the two integer parts of its TAI duration since J1900
/// (`centuries`, `nanoseconds`). The epoch comes back exactly, in UTC.
pub mod epoch_as_tai_parts {
    use hifitime::{Duration, Epoch, TimeScale};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct TaiParts {
        centuries: i16,
        nanoseconds: u64,
    }

    pub fn serialize<S: Serializer>(epoch: &Epoch, serializer: S) -> Result<S::Ok, S::Error> {
        let (centuries, nanoseconds) = epoch.to_tai_duration().to_parts();
        TaiParts {
            centuries,
            nanoseconds,
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Epoch, D::Error> {
        let parts = TaiParts::deserialize(deserializer)?;
        let tai = Epoch::from_tai_duration(Duration::from_parts(parts.centuries, parts.nanoseconds));
        Ok(tai.to_time_scale(TimeScale::UTC))
    }
}

#[cfg(test)]
mod time_test {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn parse_iso_date() {
        let epoch = parse_utc_date("2021-05-29T00:00:00").unwrap();
        assert_eq!(epoch, calendar_day(2021, 5, 29));
        assert!(parse_utc_date("not a date").is_err());
    }

    #[test]
    fn mjd_round_trip() {
        let epoch = calendar_day(2020, 1, 1);
        let back = epoch_from_mjd_utc(epoch.to_mjd_utc_days());
        assert!(separation_seconds(epoch, back) < 1e-3);
        assert_abs_diff_eq!(epoch.to_mjd_utc_days(), 58849.0, epsilon = 1e-9);
    }

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Stamped {
        #[serde(with = "epoch_as_tai_parts")]
        epoch: Epoch,
    }

    #[test]
    fn tai_parts_keep_every_nanosecond() {
        let epoch = Epoch::from_gregorian_utc(2022, 4, 10, 3, 12, 45, 123_456_789);
        let json = serde_json::to_string(&Stamped { epoch }).unwrap();
        let back: Stamped = serde_json::from_str(&json).unwrap();
        assert_eq!(back.epoch, epoch);
        assert_eq!(back.epoch.to_tai_duration(), epoch.to_tai_duration());
    }
}
