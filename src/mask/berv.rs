//! Maximum BERV amplitude used to widen telluric features.
//!
//! Over a year the barycentric correction of a target swings by up to ~±30 km/s; a telluric line
//! seen in the stellar rest frame therefore sweeps a band `λ · v_max / c` wide on each side. The
//! amplitude can be fixed, measured on the observations, or derived from the observing geometry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{KmPerSec, DEFAULT_MAX_BERV, EARTH_ORBITAL_VELOCITY, EARTH_ROTATION_VELOCITY};
use crate::frame::FrameDescriptor;
use crate::specstack_errors::SpecStackError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BervSource {
    /// Fixed amplitude, in km/s.
    Fixed { km_s: KmPerSec },
    /// Largest |BERV| among the partition's observations.
    Observed,
    /// Orbital plus rotational amplitude for a target at ecliptic latitude β observed from a
    /// site at latitude φ: `29.78 cos β + 0.465 cos φ`.
    Geometry {
        ecliptic_latitude_deg: f64,
        site_latitude_deg: f64,
    },
}

impl Default for BervSource {
    fn default() -> Self {
        BervSource::Fixed {
            km_s: DEFAULT_MAX_BERV,
        }
    }
}

impl BervSource {
    /// Amplitude for a set of observations.
    ///
    /// `Observed` over an empty set gives 0 km/s (no widening).
    pub fn max_velocity<'a>(
        &self,
        observations: impl IntoIterator<Item = &'a FrameDescriptor>,
    ) -> KmPerSec {
        match *self {
            BervSource::Fixed { km_s } => km_s.abs(),
            BervSource::Observed => observations
                .into_iter()
                .map(|d| d.berv.abs())
                .fold(0.0, f64::max),
            BervSource::Geometry {
                ecliptic_latitude_deg,
                site_latitude_deg,
            } => {
                EARTH_ORBITAL_VELOCITY * ecliptic_latitude_deg.to_radians().cos().abs()
                    + EARTH_ROTATION_VELOCITY * site_latitude_deg.to_radians().cos().abs()
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), SpecStackError> {
        match *self {
            BervSource::Fixed { km_s } if !km_s.is_finite() || km_s < 0.0 => Err(
                SpecStackError::InvalidParameter(format!("maximum BERV must be >= 0, got {km_s}")),
            ),
            BervSource::Geometry {
                ecliptic_latitude_deg: b,
                site_latitude_deg: p,
            } if !(-90.0..=90.0).contains(&b) || !(-90.0..=90.0).contains(&p) => {
                Err(SpecStackError::InvalidParameter(format!(
                    "latitudes must lie in [-90, 90] deg, got {b} and {p}"
                )))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for BervSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BervSource::Fixed { km_s } => write!(f, "{km_s}"),
            BervSource::Observed => write!(f, "observed"),
            BervSource::Geometry {
                ecliptic_latitude_deg,
                site_latitude_deg,
            } => write!(f, "geometry:{ecliptic_latitude_deg}:{site_latitude_deg}"),
        }
    }
}

impl FromStr for BervSource {
    type Err = SpecStackError;

    /// `"observed"`, a velocity in km/s (`"30"`), or `"geometry:<beta>:<phi>"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("observed") {
            return Ok(BervSource::Observed);
        }
        if let Some(rest) = s.strip_prefix("geometry:") {
            let parsed: Vec<f64> = rest
                .split(':')
                .map(|p| p.trim().parse::<f64>())
                .collect::<Result<_, _>>()
                .map_err(|e| SpecStackError::InvalidParameter(format!("{s}: {e}")))?;
            return match parsed.as_slice() {
                [beta, phi] => Ok(BervSource::Geometry {
                    ecliptic_latitude_deg: *beta,
                    site_latitude_deg: *phi,
                }),
                _ => Err(SpecStackError::InvalidParameter(format!(
                    "{s}: expected geometry:<ecliptic latitude>:<site latitude>"
                ))),
            };
        }
        s.parse::<f64>()
            .map(|km_s| BervSource::Fixed { km_s })
            .map_err(|e| SpecStackError::InvalidParameter(format!("BERV source {s}: {e}")))
    }
}

#[cfg(test)]
mod berv_test {
    use super::*;
    use crate::time::calendar_day;
    use approx::assert_relative_eq;

    #[test]
    fn observed_takes_largest_magnitude() {
        let frames: Vec<_> = [3.0, -12.5, 7.0]
            .iter()
            .enumerate()
            .map(|(i, b)| {
                FrameDescriptor::new(format!("{i}.fits"), "HARPS", calendar_day(2016, 1, 1), *b)
            })
            .collect();
        assert_eq!(BervSource::Observed.max_velocity(&frames), 12.5);
        assert_eq!(BervSource::default().max_velocity(&frames), 30.0);
    }

    #[test]
    fn geometry_on_the_ecliptic_from_the_equator() {
        let source: BervSource = "geometry:0:0".parse().unwrap();
        assert_relative_eq!(source.max_velocity(std::iter::empty()), 30.245, epsilon = 1e-12);
        let pole: BervSource = "geometry:90:0".parse().unwrap();
        assert!(pole.max_velocity(std::iter::empty()) < 1.0);
    }

    #[test]
    fn parse_and_validate() {
        assert_eq!("25".parse::<BervSource>().unwrap(), BervSource::Fixed { km_s: 25.0 });
        assert!("fast".parse::<BervSource>().is_err());
        assert!(BervSource::Fixed { km_s: -1.0 }.validate().is_err());
        assert!("geometry:100:0".parse::<BervSource>().unwrap().validate().is_err());
    }
}
